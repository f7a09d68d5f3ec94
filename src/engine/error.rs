use ulid::Ulid;

use crate::model::Ms;

/// Coarse category of an [`EngineError`], used by the wire layer to pick a SQLSTATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Forbidden,
    Conflict,
    BusinessRule,
    Fatal,
}

#[derive(Debug)]
pub enum EngineError {
    UserNotFound(Ulid),
    ItemNotFound(Ulid),
    BookingNotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidTimeRange { start: Ms, end: Ms },
    UnknownState(String),
    InvalidPage(&'static str),
    EmptyText,
    LimitExceeded(&'static str),
    SelfBookingForbidden { user_id: Ulid, item_id: Ulid },
    NotOwner { user_id: Ulid, item_id: Ulid },
    NotOwnerOfBooking { user_id: Ulid, booking_id: Ulid },
    AccessDenied { user_id: Ulid, booking_id: Ulid },
    AlreadyApproved(Ulid),
    ItemNotAvailable(Ulid),
    CommentNotAllowed { user_id: Ulid, item_id: Ulid },
    NoCompletedRental { user_id: Ulid, item_id: Ulid },
    IdExhausted,
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::UserNotFound(_)
            | EngineError::ItemNotFound(_)
            | EngineError::BookingNotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_)
            | EngineError::InvalidTimeRange { .. }
            | EngineError::UnknownState(_)
            | EngineError::InvalidPage(_)
            | EngineError::EmptyText
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::SelfBookingForbidden { .. }
            | EngineError::NotOwner { .. }
            | EngineError::NotOwnerOfBooking { .. }
            | EngineError::AccessDenied { .. } => ErrorKind::Forbidden,
            EngineError::AlreadyApproved(_) => ErrorKind::Conflict,
            EngineError::ItemNotAvailable(_)
            | EngineError::CommentNotAllowed { .. }
            | EngineError::NoCompletedRental { .. } => ErrorKind::BusinessRule,
            EngineError::IdExhausted | EngineError::WalError(_) => ErrorKind::Fatal,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::UserNotFound(id) => write!(f, "user not found: {id}"),
            EngineError::ItemNotFound(id) => write!(f, "item not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidTimeRange { start, end } => {
                write!(f, "invalid time range: start {start} must be before end {end}")
            }
            EngineError::UnknownState(s) => write!(f, "Unknown state: {s}"),
            EngineError::InvalidPage(msg) => write!(f, "invalid page: {msg}"),
            EngineError::EmptyText => write!(f, "comment text must not be blank"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::SelfBookingForbidden { user_id, item_id } => {
                write!(f, "user {user_id} owns item {item_id} and cannot book it")
            }
            EngineError::NotOwner { user_id, item_id } => {
                write!(f, "user {user_id} is not the owner of item {item_id}")
            }
            EngineError::NotOwnerOfBooking { user_id, booking_id } => {
                write!(f, "user {user_id} did not make booking {booking_id}")
            }
            EngineError::AccessDenied { user_id, booking_id } => {
                write!(f, "user {user_id} has no access to booking {booking_id}")
            }
            EngineError::AlreadyApproved(id) => write!(f, "booking {id} is already approved"),
            EngineError::ItemNotAvailable(id) => write!(f, "item {id} is not available"),
            EngineError::CommentNotAllowed { user_id, item_id } => {
                write!(f, "user {user_id} owns item {item_id} and cannot comment on it")
            }
            EngineError::NoCompletedRental { user_id, item_id } => {
                write!(f, "user {user_id} has no completed rental of item {item_id}")
            }
            EngineError::IdExhausted => write!(f, "id generator exhausted for this millisecond"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
