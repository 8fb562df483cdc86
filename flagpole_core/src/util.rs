const FLOAT_TO_INT_MAX: f64 = 9007199254740991_f64;

/// Converting float to int is undefined behaviour for huge floats. Refuse to convert floats with
/// magnitude greater than 2**53 - 1, after which 64-bit floats no longer retain integer precision.
pub(crate) fn f64_to_i64_safe(f: f64) -> Option<i64> {
    if f.abs() <= FLOAT_TO_INT_MAX {
        Some(f as i64)
    } else {
        None
    }
}

/// Service URIs are configured with or without a trailing slash; paths are always joined with a
/// leading slash, so the stored form never ends in one.
pub(crate) fn strip_trailing_slash(uri: &str) -> String {
    uri.trim_end_matches('/').to_owned()
}
