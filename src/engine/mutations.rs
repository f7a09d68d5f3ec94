use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::rules::{approve, check_comment_eligibility, validate_creation};
use super::{Engine, EngineError, Scope, WalCommand};

impl Engine {
    pub async fn register_user(
        &self,
        id: Ulid,
        name: String,
        email: Option<String>,
    ) -> Result<User, EngineError> {
        let _registry = self.registry.lock().await;
        if self.store.user_count() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if name.trim().is_empty() || name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("user name must be 1..=256 bytes"));
        }
        if email.as_ref().is_some_and(|e| e.len() > MAX_EMAIL_LEN) {
            return Err(EngineError::LimitExceeded("email too long"));
        }
        if self.store.user_exists(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::UserRegistered { id, name, email };
        self.persist_and_apply(&event).await?;
        info!("registered user {id}");
        self.store.find_user(&id).ok_or(EngineError::UserNotFound(id))
    }

    pub async fn list_item(
        &self,
        id: Ulid,
        owner_id: Ulid,
        name: String,
        description: Option<String>,
        available: bool,
    ) -> Result<Item, EngineError> {
        let _registry = self.registry.lock().await;
        if self.store.item_count() >= MAX_ITEMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many items"));
        }
        if name.trim().is_empty() || name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("item name must be 1..=256 bytes"));
        }
        if description
            .as_ref()
            .is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN)
        {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        if !self.store.user_exists(&owner_id) {
            return Err(EngineError::UserNotFound(owner_id));
        }
        if self.store.item_exists(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ItemListed {
            id,
            owner_id,
            name,
            description,
            available,
        };
        self.persist_and_apply(&event).await?;
        info!("user {owner_id} listed item {id}");
        self.store.find_item(&id).ok_or(EngineError::ItemNotFound(id))
    }

    /// Request a booking. The new booking starts out `WAITING`.
    pub async fn create_booking(
        &self,
        renter_id: Ulid,
        item_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Booking, EngineError> {
        if !self.store.user_exists(&renter_id) {
            return Err(EngineError::UserNotFound(renter_id));
        }
        let item = self
            .store
            .find_item(&item_id)
            .ok_or(EngineError::ItemNotFound(item_id))?;
        let span = validate_creation(renter_id, &item, start, end)?;

        let id = self.next_id()?;
        let event = Event::BookingRequested {
            id,
            renter_id,
            item_id,
            span,
        };
        self.persist_and_apply(&event).await?;
        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!("booking {id} requested by {renter_id} for item {item_id} [{start}, {end})");

        Ok(Booking {
            id,
            renter_id,
            item_id,
            span,
            status: BookingStatus::Waiting,
        })
    }

    /// Delete a booking on behalf of its renter. Returns the booking as it was.
    pub async fn delete_booking(
        &self,
        booking_id: Ulid,
        requester_id: Ulid,
    ) -> Result<Booking, EngineError> {
        let lock = self
            .store
            .row_lock(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let _row = lock.lock_owned().await;
        let booking = self
            .store
            .find_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        if booking.renter_id != requester_id {
            return Err(EngineError::NotOwnerOfBooking {
                user_id: requester_id,
                booking_id,
            });
        }

        self.persist_and_apply(&Event::BookingDeleted { id: booking_id })
            .await?;
        metrics::counter!(observability::BOOKINGS_DELETED_TOTAL).increment(1);
        info!("booking {booking_id} removed by {requester_id}");
        Ok(booking)
    }

    /// Approve (`approved = true`) or reject a booking as the item's owner.
    ///
    /// Runs under the booking's row lock, so two concurrent approvals can't
    /// both see `WAITING`.
    pub async fn set_approval(
        &self,
        booking_id: Ulid,
        requester_id: Ulid,
        approved: bool,
    ) -> Result<Booking, EngineError> {
        let lock = self
            .store
            .row_lock(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let _row = lock.lock_owned().await;
        let mut booking = self
            .store
            .find_booking(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let item = self
            .store
            .find_item(&booking.item_id)
            .ok_or(EngineError::ItemNotFound(booking.item_id))?;

        let status = approve(&booking, &item, requester_id, approved, self.policy)?;
        let event = Event::BookingStatusChanged {
            id: booking_id,
            status,
        };
        self.persist_and_apply(&event).await?;
        metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "status" => status.as_str())
            .increment(1);
        info!("booking {booking_id}: {} -> {status}", booking.status);

        booking.status = status;
        Ok(booking)
    }

    pub async fn add_comment(
        &self,
        author_id: Ulid,
        item_id: Ulid,
        text: String,
    ) -> Result<Comment, EngineError> {
        let item = self
            .store
            .find_item(&item_id)
            .ok_or(EngineError::ItemNotFound(item_id))?;
        if !self.store.user_exists(&author_id) {
            return Err(EngineError::UserNotFound(author_id));
        }
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(EngineError::EmptyText);
        }
        if text.len() > MAX_COMMENT_LEN {
            return Err(EngineError::LimitExceeded("comment too long"));
        }

        let now = self.now();
        let rentals = self.store.query(Scope::Renter(author_id), &Bucket::Past.filter(now));
        check_comment_eligibility(author_id, &item, &rentals, now)?;

        let id = self.next_id()?;
        let event = Event::CommentAdded {
            id,
            item_id,
            author_id,
            text: text.clone(),
            created_at: now,
        };
        self.persist_and_apply(&event).await?;
        info!("comment {id} on item {item_id} by {author_id}");

        Ok(Comment {
            id,
            item_id,
            author_id,
            text,
            created_at: now,
        })
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::new();
        for u in self.store.users() {
            events.push(Event::UserRegistered {
                id: u.id,
                name: u.name,
                email: u.email,
            });
        }
        for i in self.store.items() {
            events.push(Event::ItemListed {
                id: i.id,
                owner_id: i.owner_id,
                name: i.name,
                description: i.description,
                available: i.available,
            });
        }
        for b in self.store.bookings() {
            events.push(Event::BookingRequested {
                id: b.id,
                renter_id: b.renter_id,
                item_id: b.item_id,
                span: b.span,
            });
            if b.status != BookingStatus::Waiting {
                events.push(Event::BookingStatusChanged {
                    id: b.id,
                    status: b.status,
                });
            }
        }
        for c in self.store.comments() {
            events.push(Event::CommentAdded {
                id: c.id,
                item_id: c.item_id,
                author_id: c.author_id,
                text: c.text,
                created_at: c.created_at,
            });
        }

        let count = events.len();
        self.wal_request(|response| WalCommand::Compact { events, response })
            .await?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        match self
            .wal_request(|response| WalCommand::AppendsSinceCompact { response })
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!("cannot read WAL append count: {e}");
                0
            }
        }
    }
}
