//! Status codes returned by every bridge function.
//!
//! Non-negative means success; for functions that write into a guest buffer
//! it is also the number of bytes written. Negative values are one of
//! [`Status`].

/// Failure codes shared by all bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    /// The key or row does not exist.
    NotFound = -1,
    /// The guest's output buffer cannot hold the result.
    BufferTooSmall = -2,
    /// Bad pointer/length or input that is not UTF-8.
    InvalidInput = -3,
    /// Backend disabled, unreachable or failing.
    Unavailable = -4,
}

impl Status {
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl From<Status> for i32 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

/// Clamp a count or length into a non-negative status value.
pub fn count(n: u64) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_and_negative() {
        let all = [
            Status::NotFound,
            Status::BufferTooSmall,
            Status::InvalidInput,
            Status::Unavailable,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }

    #[test]
    fn test_count_clamps() {
        assert_eq!(count(0), 0);
        assert_eq!(count(42), 42);
        assert_eq!(count(u64::MAX), i32::MAX);
    }
}
