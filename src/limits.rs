use crate::model::{DAY_MS, Ms};

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;

pub const MAX_PAGE_SIZE: usize = 1_000;
pub const DEFAULT_PAGE_SIZE: usize = 10;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_DESCRIPTION_LEN: usize = 4_096;
pub const MAX_COMMENT_LEN: usize = 4_096;

pub const MAX_USERS_PER_TENANT: usize = 1_000_000;
pub const MAX_ITEMS_PER_TENANT: usize = 1_000_000;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 64;
