use ulid::Ulid;

use crate::model::*;

use super::rules::{last_and_next, order_bookings, page_window, paginate, parse_bucket};
use super::{Engine, EngineError, Scope};

impl Engine {
    pub fn find_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.store.find_user(&id).ok_or(EngineError::UserNotFound(id))
    }

    pub fn find_item(&self, id: Ulid) -> Result<Item, EngineError> {
        self.store.find_item(&id).ok_or(EngineError::ItemNotFound(id))
    }

    /// A booking, visible to its renter and to the owner of the booked item.
    pub fn get_booking(&self, booking_id: Ulid, requester_id: Ulid) -> Result<Booking, EngineError> {
        let booking = self
            .store
            .find_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let owner_id = self.find_item(booking.item_id)?.owner_id;
        if requester_id != booking.renter_id && requester_id != owner_id {
            return Err(EngineError::AccessDenied {
                user_id: requester_id,
                booking_id,
            });
        }
        Ok(booking)
    }

    /// One page of a user's bookings in `state`, latest-ending first.
    ///
    /// `from` is an item offset, not a page number.
    pub fn list_bookings(
        &self,
        user_id: Ulid,
        perspective: Perspective,
        state: &str,
        from: i64,
        size: i64,
    ) -> Result<Vec<Booking>, EngineError> {
        if !self.store.user_exists(&user_id) {
            return Err(EngineError::UserNotFound(user_id));
        }
        let bucket = parse_bucket(state)?;
        let page = page_window(from, size)?;

        let filter = bucket.filter(self.now());
        let mut bookings = self
            .store
            .query(Scope::for_perspective(user_id, perspective), &filter);
        order_bookings(&mut bookings);
        Ok(paginate(bookings, page))
    }

    pub fn list_for_renter(
        &self,
        renter_id: Ulid,
        state: &str,
        from: i64,
        size: i64,
    ) -> Result<Vec<Booking>, EngineError> {
        self.list_bookings(renter_id, Perspective::Renter, state, from, size)
    }

    pub fn list_for_owner(
        &self,
        owner_id: Ulid,
        state: &str,
        from: i64,
        size: i64,
    ) -> Result<Vec<Booking>, EngineError> {
        self.list_bookings(owner_id, Perspective::Owner, state, from, size)
    }

    pub fn list_comments(&self, item_id: Ulid) -> Result<Vec<Comment>, EngineError> {
        if !self.store.item_exists(&item_id) {
            return Err(EngineError::ItemNotFound(item_id));
        }
        Ok(self.store.comments_for_item(&item_id))
    }

    /// The item with its comments. Only the owner also sees the last and next booking.
    pub fn view_item(&self, item_id: Ulid, viewer_id: Ulid) -> Result<ItemView, EngineError> {
        let item = self.find_item(item_id)?;
        Ok(self.item_view(item, viewer_id))
    }

    /// One page of the items `owner_id` listed, each with its schedule and
    /// comments, in listing order.
    pub fn list_items(
        &self,
        owner_id: Ulid,
        from: i64,
        size: i64,
    ) -> Result<Vec<ItemView>, EngineError> {
        if !self.store.user_exists(&owner_id) {
            return Err(EngineError::UserNotFound(owner_id));
        }
        let page = page_window(from, size)?;
        let items = paginate(self.store.items_owned_by(&owner_id), page);
        Ok(items
            .into_iter()
            .map(|item| self.item_view(item, owner_id))
            .collect())
    }

    fn item_view(&self, item: Item, viewer_id: Ulid) -> ItemView {
        let comments = self.store.comments_for_item(&item.id);
        let (last_booking, next_booking) = if item.owner_id == viewer_id {
            let bookings = self
                .store
                .query(Scope::Item(item.id), &BookingFilter::default());
            last_and_next(&bookings, self.now())
        } else {
            (None, None)
        };
        ItemView {
            item,
            last_booking,
            next_booking,
            comments,
        }
    }
}
