use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::model::*;

/// Per-booking lock held across read-check-write of that booking.
pub type RowLock = Arc<Mutex<()>>;

/// Which bookings a store query walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Bookings made by this user.
    Renter(Ulid),
    /// Bookings on any item this user owns.
    Owner(Ulid),
    /// Bookings on this item.
    Item(Ulid),
}

impl Scope {
    pub fn for_perspective(user_id: Ulid, perspective: Perspective) -> Self {
        match perspective {
            Perspective::Renter => Scope::Renter(user_id),
            Perspective::Owner => Scope::Owner(user_id),
        }
    }
}

/// In-memory state of one marketplace. Every change goes through
/// [`InMemoryStore::apply_event`] so replay and live writes share one path.
pub struct InMemoryStore {
    users: DashMap<Ulid, User>,
    items: DashMap<Ulid, Item>,
    bookings: DashMap<Ulid, Booking>,
    comments: DashMap<Ulid, Comment>,
    items_by_owner: DashMap<Ulid, Vec<Ulid>>,
    bookings_by_renter: DashMap<Ulid, Vec<Ulid>>,
    bookings_by_item: DashMap<Ulid, Vec<Ulid>>,
    comments_by_item: DashMap<Ulid, Vec<Ulid>>,
    row_locks: DashMap<Ulid, RowLock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            items: DashMap::new(),
            bookings: DashMap::new(),
            comments: DashMap::new(),
            items_by_owner: DashMap::new(),
            bookings_by_renter: DashMap::new(),
            bookings_by_item: DashMap::new(),
            comments_by_item: DashMap::new(),
            row_locks: DashMap::new(),
        }
    }

    // ── Users ────────────────────────────────────────────────

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn user_exists(&self, id: &Ulid) -> bool {
        self.users.contains_key(id)
    }

    pub fn find_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        users
    }

    // ── Items ────────────────────────────────────────────────

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn item_exists(&self, id: &Ulid) -> bool {
        self.items.contains_key(id)
    }

    pub fn find_item(&self, id: &Ulid) -> Option<Item> {
        self.items.get(id).map(|e| e.value().clone())
    }

    /// Items listed by `owner_id`, ordered by id.
    pub fn items_owned_by(&self, owner_id: &Ulid) -> Vec<Item> {
        let mut items: Vec<Item> = index_snapshot(&self.items_by_owner, owner_id)
            .iter()
            .filter_map(|id| self.find_item(id))
            .collect();
        items.sort_by_key(|i| i.id);
        items
    }

    pub fn items(&self) -> Vec<Item> {
        let mut items: Vec<Item> = self.items.iter().map(|e| e.value().clone()).collect();
        items.sort_by_key(|i| i.id);
        items
    }

    // ── Bookings ─────────────────────────────────────────────

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    pub fn find_booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn row_lock(&self, id: &Ulid) -> Option<RowLock> {
        self.row_locks.get(id).map(|e| e.value().clone())
    }

    /// Bookings in `scope` matching `filter`, unordered.
    pub fn query(&self, scope: Scope, filter: &BookingFilter) -> Vec<Booking> {
        let ids = match scope {
            Scope::Renter(user_id) => index_snapshot(&self.bookings_by_renter, &user_id),
            Scope::Item(item_id) => index_snapshot(&self.bookings_by_item, &item_id),
            Scope::Owner(owner_id) => index_snapshot(&self.items_by_owner, &owner_id)
                .iter()
                .flat_map(|item_id| index_snapshot(&self.bookings_by_item, item_id))
                .collect(),
        };
        ids.iter()
            .filter_map(|id| self.find_booking(id))
            .filter(|b| filter.matches(b))
            .collect()
    }

    /// Every booking, ordered by id (creation order).
    pub fn bookings(&self) -> Vec<Booking> {
        let mut all: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|b| b.id);
        all
    }

    // ── Comments ─────────────────────────────────────────────

    pub fn comments_for_item(&self, item_id: &Ulid) -> Vec<Comment> {
        let mut comments: Vec<Comment> = index_snapshot(&self.comments_by_item, item_id)
            .iter()
            .filter_map(|id| self.comments.get(id).map(|e| e.value().clone()))
            .collect();
        comments.sort_by_key(|c| c.id);
        comments
    }

    pub fn comments(&self) -> Vec<Comment> {
        let mut all: Vec<Comment> = self.comments.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|c| c.id);
        all
    }

    // ── Event application ────────────────────────────────────

    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::UserRegistered { id, name, email } => {
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                    },
                );
            }
            Event::ItemListed {
                id,
                owner_id,
                name,
                description,
                available,
            } => {
                let previous = self.items.insert(
                    *id,
                    Item {
                        id: *id,
                        owner_id: *owner_id,
                        name: name.clone(),
                        description: description.clone(),
                        available: *available,
                    },
                );
                if let Some(prev) = previous.filter(|p| p.owner_id != *owner_id) {
                    if let Some(mut ids) = self.items_by_owner.get_mut(&prev.owner_id) {
                        ids.retain(|x| x != id);
                    }
                }
                let mut owned = self.items_by_owner.entry(*owner_id).or_default();
                if !owned.contains(id) {
                    owned.push(*id);
                }
            }
            Event::BookingRequested {
                id,
                renter_id,
                item_id,
                span,
            } => {
                self.bookings.insert(
                    *id,
                    Booking {
                        id: *id,
                        renter_id: *renter_id,
                        item_id: *item_id,
                        span: *span,
                        status: BookingStatus::Waiting,
                    },
                );
                self.bookings_by_renter.entry(*renter_id).or_default().push(*id);
                self.bookings_by_item.entry(*item_id).or_default().push(*id);
                self.row_locks.insert(*id, Arc::new(Mutex::new(())));
            }
            Event::BookingStatusChanged { id, status } => {
                if let Some(mut b) = self.bookings.get_mut(id) {
                    b.status = *status;
                }
            }
            Event::BookingDeleted { id } => {
                if let Some((_, b)) = self.bookings.remove(id) {
                    if let Some(mut ids) = self.bookings_by_renter.get_mut(&b.renter_id) {
                        ids.retain(|x| x != id);
                    }
                    if let Some(mut ids) = self.bookings_by_item.get_mut(&b.item_id) {
                        ids.retain(|x| x != id);
                    }
                }
                self.row_locks.remove(id);
            }
            Event::CommentAdded {
                id,
                item_id,
                author_id,
                text,
                created_at,
            } => {
                self.comments.insert(
                    *id,
                    Comment {
                        id: *id,
                        item_id: *item_id,
                        author_id: *author_id,
                        text: text.clone(),
                        created_at: *created_at,
                    },
                );
                self.comments_by_item.entry(*item_id).or_default().push(*id);
            }
        }
    }
}

fn index_snapshot(index: &DashMap<Ulid, Vec<Ulid>>, key: &Ulid) -> Vec<Ulid> {
    index
        .get(key)
        .map(|e| e.value().clone())
        .unwrap_or_default()
}
