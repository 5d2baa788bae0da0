//! Runtime configuration from the `MALLOC_OPTIONS` environment string.
//!
//! The string is a sequence of single-character options, each optionally
//! preceded by a decimal repeat count.  Lowercase disables, uppercase
//! enables/doubles.  Unknown characters produce a diagnostic on stderr and
//! are otherwise ignored.

use crate::heap::classes::DIRTY_MAX_DEFAULT;
use crate::sync::OnceLock;

/// Fill byte for fresh allocations when junk filling is enabled.
pub(crate) const ALLOC_JUNK: u8 = 0xe4;
/// Fill byte for freed regions when junk filling is enabled.
pub(crate) const ALLOC_POISON: u8 = 0xe5;

#[derive(Clone, Debug)]
pub(crate) struct Options {
    /// Dirty-page cap for the main arena; thread-local arenas use an eighth.
    pub dirty_max: usize,
    /// Junk-fill allocations and poison freed memory (debug builds only).
    pub junk: bool,
    /// Zero-fill allocations instead of junk filling (debug builds only).
    pub zero: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dirty_max: DIRTY_MAX_DEFAULT,
            junk: cfg!(debug_assertions),
            zero: false,
        }
    }
}

static OPTIONS: OnceLock<Options> = OnceLock::new();

pub(crate) fn options() -> &'static Options {
    OPTIONS.get_or_init(|| {
        let raw = std::env::var("MALLOC_OPTIONS").unwrap_or_default();
        parse(&raw)
    })
}

/// Fill a fresh allocation per the active options.
pub(crate) fn junk_fill(addr: usize, len: usize) {
    let o = options();
    if o.junk {
        // Safety: the caller owns the freshly allocated range.
        unsafe { std::ptr::write_bytes(addr as *mut u8, ALLOC_JUNK, len) };
    } else if o.zero {
        // Safety: as above.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len) };
    }
}

/// Poison a freed (or truncated) region per the active options.
pub(crate) fn poison_fill(addr: usize, len: usize) {
    if options().junk {
        // Safety: the caller owns the region being released.
        unsafe { std::ptr::write_bytes(addr as *mut u8, ALLOC_POISON, len) };
    }
}

pub(crate) fn parse(opts: &str) -> Options {
    let mut o = Options::default();
    let bytes = opts.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        // Parse repetition count, if any.
        let mut nreps = 0usize;
        let mut nseen = false;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            nreps = nreps.wrapping_mul(10).wrapping_add((bytes[i] - b'0') as usize);
            nseen = true;
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let c = bytes[i] as char;
        let reps = if nseen { nreps } else { 1 };
        for _ in 0..reps {
            match c {
                'f' => o.dirty_max >>= 1,
                'F' => {
                    if o.dirty_max == 0 {
                        o.dirty_max = 1;
                    } else if o.dirty_max << 1 != 0 {
                        o.dirty_max <<= 1;
                    }
                }
                #[cfg(debug_assertions)]
                'j' => o.junk = false,
                #[cfg(debug_assertions)]
                'J' => o.junk = true,
                #[cfg(debug_assertions)]
                'z' => o.zero = false,
                #[cfg(debug_assertions)]
                'Z' => o.zero = true,
                _ => {
                    eprintln!("arenalloc: unsupported character in MALLOC_OPTIONS: '{c}'");
                }
            }
        }
        i += 1;
    }
    o
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let o = parse("");
        assert_eq!(o.dirty_max, DIRTY_MAX_DEFAULT);
        assert_eq!(o.junk, cfg!(debug_assertions));
        assert!(!o.zero);
    }

    #[test]
    fn test_parse_dirty_max_steps() {
        assert_eq!(parse("f").dirty_max, DIRTY_MAX_DEFAULT >> 1);
        assert_eq!(parse("ff").dirty_max, DIRTY_MAX_DEFAULT >> 2);
        assert_eq!(parse("3f").dirty_max, DIRTY_MAX_DEFAULT >> 3);
        assert_eq!(parse("F").dirty_max, DIRTY_MAX_DEFAULT << 1);
        assert_eq!(parse("2F").dirty_max, DIRTY_MAX_DEFAULT << 2);
    }

    #[test]
    fn test_parse_dirty_max_floor() {
        // Halving all the way down sticks at zero, and one 'F' recovers to 1.
        let o = parse("64f");
        assert_eq!(o.dirty_max, 0);
        let o = parse("64fF");
        assert_eq!(o.dirty_max, 1);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn test_parse_junk_zero_toggles() {
        assert!(!parse("j").junk);
        assert!(parse("jJ").junk);
        assert!(parse("Z").zero);
        assert!(!parse("Zz").zero);
    }

    #[test]
    fn test_parse_unknown_ignored() {
        // Unknown characters only produce a diagnostic.
        let o = parse("q2w");
        assert_eq!(o.dirty_max, DIRTY_MAX_DEFAULT);
    }
}
