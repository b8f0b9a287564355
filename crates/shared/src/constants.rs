/// Length in bytes of the per-user password salt.
pub const SALT_LENGTH: usize = 16;
/// Maximum length for user display names.
pub const MAX_DISPLAY_NAME_LENGTH: usize = 64;
/// Maximum length for usernames.
pub const MAX_USERNAME_LENGTH: usize = 32;
/// Maximum size for a single plaintext message in bytes.
pub const MAX_MESSAGE_SIZE_BYTES: usize = 8 * 1024;
/// Messages returned per history page when the caller gives no limit.
pub const DEFAULT_MESSAGE_PAGE_SIZE: u32 = 20;
/// Upper bound on messages returned per history page.
pub const MAX_MESSAGE_PAGE_SIZE: u32 = 100;
