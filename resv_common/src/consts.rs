//! Workspace-wide constants.
//!
//! Single source of truth for the shared-fence trie geometry and the wait
//! defaults. Imported by all crates, no duplication permitted.

use static_assertions::const_assert;
use std::time::Duration;

/// Key bits consumed per trie level.
pub const SHARED_BITS: u32 = 4;

/// Branching factor of a shared-fence layer (slots per layer).
pub const SHARED_FANOUT: usize = 1 << SHARED_BITS;

/// Mask selecting one digit of a key.
pub const SHARED_DIGIT_MASK: u64 = (SHARED_FANOUT as u64) - 1;

/// Number of levels needed to address every `u64` key.
pub const MAX_LEVELS: usize = (u64::BITS / SHARED_BITS) as usize;

/// Upper bound on layers a single insert may need: a new root plus a fresh
/// path from the root down to a leaf.
pub const MAX_LAYERS_PER_INSERT: usize = MAX_LEVELS + 1;

/// Default bound on optimistic read retries before a reader backs off.
pub const DEFAULT_READ_RETRIES: u32 = 64;

/// Timeout meaning "wait until signaled".
pub const MAX_WAIT_TIMEOUT: Duration = Duration::MAX;

/// Default configuration file searched by the stress driver.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/resv/stress.toml";

// Bitmaps are stored in a u16.
const_assert!(SHARED_FANOUT == u16::BITS as usize);
const_assert!(u64::BITS % SHARED_BITS == 0);
const_assert!(MAX_LEVELS <= u8::MAX as usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_consistent() {
        assert_eq!(SHARED_FANOUT, 16);
        assert_eq!(SHARED_DIGIT_MASK, 0xf);
        assert_eq!(MAX_LEVELS, 16);
        assert_eq!(MAX_LAYERS_PER_INSERT, 17);
        assert!(DEFAULT_READ_RETRIES > 0);
    }

    #[test]
    fn levels_cover_the_key_space() {
        // Each level consumes SHARED_BITS bits of the key.
        assert_eq!(MAX_LEVELS as u32 * SHARED_BITS, u64::BITS);
    }
}
