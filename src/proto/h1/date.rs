use std::cell::RefCell;
use std::time::{Duration, SystemTime};

// "Sun, 06 Nov 1994 08:49:37 GMT".len()
pub(crate) const DATE_VALUE_LENGTH: usize = 29;

/// Appends the cached `Date` value, refreshing it at most once per second.
pub(crate) fn extend(dst: &mut Vec<u8>) {
    CACHED.with(|cache| {
        dst.extend_from_slice(cache.borrow_mut().buffer());
    })
}

/// Current cached value as owned bytes, for HTTP/2 response headers.
pub(crate) fn header_value() -> Vec<u8> {
    let mut value = Vec::with_capacity(DATE_VALUE_LENGTH);
    extend(&mut value);
    value
}

/// Refreshes the cache if a second has passed; called before each batch.
pub(crate) fn update() {
    CACHED.with(|cache| {
        cache.borrow_mut().check();
    })
}

struct CachedDate {
    bytes: [u8; DATE_VALUE_LENGTH],
    next_update: SystemTime,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate::new()));

impl CachedDate {
    fn new() -> Self {
        let mut cache = CachedDate {
            bytes: [0; DATE_VALUE_LENGTH],
            next_update: SystemTime::UNIX_EPOCH,
        };
        cache.update(SystemTime::now());
        cache
    }

    fn buffer(&mut self) -> &[u8] {
        self.check();
        &self.bytes[..]
    }

    fn check(&mut self) {
        let now = SystemTime::now();
        if now > self.next_update {
            self.update(now);
        }
    }

    fn update(&mut self, now: SystemTime) {
        let formatted = httpdate::fmt_http_date(now);
        debug_assert_eq!(formatted.len(), DATE_VALUE_LENGTH);
        self.bytes.copy_from_slice(formatted.as_bytes());
        self.next_update = now + Duration::from_secs(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_len() {
        assert_eq!(DATE_VALUE_LENGTH, "Sun, 06 Nov 1994 08:49:37 GMT".len());
    }

    #[test]
    fn extend_produces_imf_fixdate() {
        update();
        let mut buf = Vec::new();
        extend(&mut buf);
        assert_eq!(buf.len(), DATE_VALUE_LENGTH);
        assert!(buf.ends_with(b" GMT"));
        assert!(httpdate::parse_http_date(std::str::from_utf8(&buf).unwrap()).is_ok());
    }
}
