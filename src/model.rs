use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    pub fn ended_before(&self, t: Ms) -> bool {
        self.end < t
    }

    pub fn starts_after(&self, t: Ms) -> bool {
        self.start > t
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Waiting,
    Approved,
    Rejected,
    /// Kept for compatibility with older logs. No operation produces it.
    Canceled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Waiting => "WAITING",
            BookingStatus::Approved => "APPROVED",
            BookingStatus::Rejected => "REJECTED",
            BookingStatus::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub renter_id: Ulid,
    pub item_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Ulid,
    pub item_id: Ulid,
    pub author_id: Ulid,
    pub text: String,
    pub created_at: Ms,
}

/// Whose bookings a listing covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    /// Bookings the user made.
    Renter,
    /// Bookings on items the user owns.
    Owner,
}

/// Named slice of bookings used for filtered listing. Derived per query, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    All,
    Current,
    Past,
    Future,
    Waiting,
    Rejected,
}

impl Bucket {
    pub const EVERY: [Bucket; 6] = [
        Bucket::All,
        Bucket::Current,
        Bucket::Past,
        Bucket::Future,
        Bucket::Waiting,
        Bucket::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::All => "ALL",
            Bucket::Current => "CURRENT",
            Bucket::Past => "PAST",
            Bucket::Future => "FUTURE",
            Bucket::Waiting => "WAITING",
            Bucket::Rejected => "REJECTED",
        }
    }
}

/// Returned when a bucket name is not one of the six known ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownBucket(pub String);

impl FromStr for Bucket {
    type Err = UnknownBucket;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Bucket::EVERY
            .into_iter()
            .find(|b| b.as_str() == upper)
            .ok_or(UnknownBucket(upper))
    }
}

/// Store-level predicate a bucket compiles to. Every bound is strict except
/// `start_at_most`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub start_at_most: Option<Ms>,
    pub start_after: Option<Ms>,
    pub end_after: Option<Ms>,
    pub end_before: Option<Ms>,
    pub status: Option<BookingStatus>,
}

impl BookingFilter {
    pub fn matches(&self, b: &Booking) -> bool {
        self.start_at_most.is_none_or(|t| b.span.start <= t)
            && self.start_after.is_none_or(|t| b.span.start > t)
            && self.end_after.is_none_or(|t| b.span.end > t)
            && self.end_before.is_none_or(|t| b.span.end < t)
            && self.status.is_none_or(|s| b.status == s)
    }
}

/// Offset window over an ordered listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub from: usize,
    pub size: usize,
}

/// Flat event types, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
        email: Option<String>,
    },
    ItemListed {
        id: Ulid,
        owner_id: Ulid,
        name: String,
        description: Option<String>,
        available: bool,
    },
    BookingRequested {
        id: Ulid,
        renter_id: Ulid,
        item_id: Ulid,
        span: Span,
    },
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
    },
    BookingDeleted {
        id: Ulid,
    },
    CommentAdded {
        id: Ulid,
        item_id: Ulid,
        author_id: Ulid,
        text: String,
        created_at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

/// An item as seen by one viewer. `last_booking`/`next_booking` are only
/// filled in for the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemView {
    pub item: Item,
    pub last_booking: Option<Booking>,
    pub next_booking: Option<Booking>,
    pub comments: Vec<Comment>,
}
