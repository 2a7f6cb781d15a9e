use aliri_braid::braid;
use std::fmt;

macro_rules! redacted {
    ($ty:ty: $hidden:literal, $visible:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    reveal_prefix(&self.0, &mut *f, $visible)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    reveal_prefix(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

/// Writes at most `visible` characters (or the formatter width) of a secret
fn reveal_prefix(secret: &str, f: &mut fmt::Formatter, visible: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(visible);
    if max_len <= 1 {
        return f.write_str("…");
    }

    match secret.char_indices().nth(max_len - 1) {
        Some((idx, _)) => {
            f.write_str(&secret[..idx])?;
            f.write_str("…")
        }
        None => f.write_str(secret),
    }
}

/// A bearer token issued by the authentication API
///
/// Formatting never reveals the token unless the alternate flag is used,
/// so tokens can be passed to `tracing` fields safely.
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef: "ACCESS TOKEN", 12);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_formatting_hides_the_token() {
        let token = AccessToken::from_static("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(format!("{}", token), "***ACCESS TOKEN***");
        assert_eq!(format!("{:?}", token), "***ACCESS TOKEN***");
    }

    #[test]
    fn alternate_debug_reveals_a_prefix() {
        let token = AccessToken::from_static("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(format!("{:#?}", token), "\"abcdefghijk…\"");
        assert_eq!(format!("{:#5?}", token), "\"abcd…\"");
    }

    #[test]
    fn alternate_display_reveals_everything() {
        let token = AccessToken::from_static("abc");
        assert_eq!(format!("{:#}", token), "abc");
    }
}
