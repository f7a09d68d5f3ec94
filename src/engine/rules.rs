//! Booking rules: pure functions over the data model, no I/O.

use std::str::FromStr;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// How approval treats a booking that is already `APPROVED`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransitionPolicy {
    /// The owner may still reject an approved booking.
    #[default]
    Revocable,
    /// Approved is terminal; any approval call on it fails before the owner check.
    Final,
}

impl FromStr for TransitionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "revocable" => Ok(TransitionPolicy::Revocable),
            "final" => Ok(TransitionPolicy::Final),
            other => Err(format!("unknown approval policy: {other}")),
        }
    }
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Check that `renter_id` may book `item` for `[start, end)` and return the span.
pub fn validate_creation(renter_id: Ulid, item: &Item, start: Ms, end: Ms) -> Result<Span, EngineError> {
    if !item.available {
        return Err(EngineError::ItemNotAvailable(item.id));
    }
    if item.owner_id == renter_id {
        return Err(EngineError::SelfBookingForbidden {
            user_id: renter_id,
            item_id: item.id,
        });
    }
    if start >= end {
        return Err(EngineError::InvalidTimeRange { start, end });
    }
    let span = Span::new(start, end);
    validate_span(&span)?;
    Ok(span)
}

impl Bucket {
    /// WAITING and REJECTED look at status only; the time buckets ignore status.
    pub fn matches(&self, booking: &Booking, now: Ms) -> bool {
        self.filter(now).matches(booking)
    }

    pub fn filter(&self, now: Ms) -> BookingFilter {
        match self {
            Bucket::All => BookingFilter::default(),
            Bucket::Current => BookingFilter {
                start_at_most: Some(now),
                end_after: Some(now),
                ..Default::default()
            },
            Bucket::Past => BookingFilter {
                end_before: Some(now),
                ..Default::default()
            },
            Bucket::Future => BookingFilter {
                start_after: Some(now),
                ..Default::default()
            },
            Bucket::Waiting => BookingFilter {
                status: Some(BookingStatus::Waiting),
                ..Default::default()
            },
            Bucket::Rejected => BookingFilter {
                status: Some(BookingStatus::Rejected),
                ..Default::default()
            },
        }
    }
}

/// Every bucket `booking` falls into at `now`, in declaration order.
pub fn classify(booking: &Booking, now: Ms) -> Vec<Bucket> {
    Bucket::EVERY
        .into_iter()
        .filter(|b| b.matches(booking, now))
        .collect()
}

pub fn parse_bucket(state: &str) -> Result<Bucket, EngineError> {
    state
        .parse::<Bucket>()
        .map_err(|e| EngineError::UnknownState(e.0))
}

/// Status a booking moves to when `requester_id` calls approve on it.
pub fn approve(
    booking: &Booking,
    item: &Item,
    requester_id: Ulid,
    approved: bool,
    policy: TransitionPolicy,
) -> Result<BookingStatus, EngineError> {
    let already_approved = booking.status == BookingStatus::Approved;
    if policy == TransitionPolicy::Final && already_approved {
        return Err(EngineError::AlreadyApproved(booking.id));
    }
    if item.owner_id != requester_id {
        return Err(EngineError::NotOwner {
            user_id: requester_id,
            item_id: item.id,
        });
    }
    if approved && already_approved {
        return Err(EngineError::AlreadyApproved(booking.id));
    }
    Ok(if approved {
        BookingStatus::Approved
    } else {
        BookingStatus::Rejected
    })
}

/// Latest-ending first. Ties fall back to id, which is creation order.
pub fn order_bookings(bookings: &mut [Booking]) {
    bookings.sort_by(|a, b| b.span.end.cmp(&a.span.end).then(a.id.cmp(&b.id)));
}

/// `last`: greatest end among started, non-rejected bookings.
/// `next`: smallest start among not-yet-started, non-rejected bookings.
pub fn last_and_next(bookings: &[Booking], now: Ms) -> (Option<Booking>, Option<Booking>) {
    let mut live: Vec<Booking> = bookings
        .iter()
        .filter(|b| b.status != BookingStatus::Rejected)
        .cloned()
        .collect();
    order_bookings(&mut live);

    let last = live.iter().find(|b| b.span.start < now).cloned();
    let next = live
        .iter()
        .filter(|b| b.span.starts_after(now))
        .min_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)))
        .cloned();
    (last, next)
}

/// A user may comment on an item they do not own once one of their rentals of it has ended.
pub fn check_comment_eligibility(
    author_id: Ulid,
    item: &Item,
    author_bookings: &[Booking],
    now: Ms,
) -> Result<(), EngineError> {
    if item.owner_id == author_id {
        return Err(EngineError::CommentNotAllowed {
            user_id: author_id,
            item_id: item.id,
        });
    }
    let rented = author_bookings
        .iter()
        .any(|b| b.item_id == item.id && b.renter_id == author_id && b.span.ended_before(now));
    if !rented {
        return Err(EngineError::NoCompletedRental {
            user_id: author_id,
            item_id: item.id,
        });
    }
    Ok(())
}

/// Validate a raw `(from, size)` pair into an offset window.
pub fn page_window(from: i64, size: i64) -> Result<Page, EngineError> {
    if from < 0 {
        return Err(EngineError::InvalidPage("from must not be negative"));
    }
    if size <= 0 {
        return Err(EngineError::InvalidPage("size must be positive"));
    }
    if size as u64 > MAX_PAGE_SIZE as u64 {
        return Err(EngineError::InvalidPage("size too large"));
    }
    Ok(Page {
        from: usize::try_from(from).map_err(|_| EngineError::InvalidPage("from too large"))?,
        size: size as usize,
    })
}

pub fn paginate<T>(rows: Vec<T>, page: Page) -> Vec<T> {
    rows.into_iter().skip(page.from).take(page.size).collect()
}
