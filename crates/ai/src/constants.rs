/// Sentinel id spliced into the token sequence where the image embedding goes.
pub const IMAGE_TOKEN_INDEX: i64 = -200;
pub const DEFAULT_IMAGE_TOKEN: &str = "<image>";
pub const DEFAULT_IM_START_TOKEN: &str = "<im_start>";
pub const DEFAULT_IM_END_TOKEN: &str = "<im_end>";
pub const DEFAULT_MAX_NEW_TOKENS: usize = 1024;
