//! # Events
//!
//! The (source, value) pairs delivered by the event-notification
//! collaborator, and how a wait registration is packed into a fiber's
//! context word.

/// Wildcard source: a registration with this id matches every source.
pub const ID_ANY: u16 = 0;

/// Wildcard value: a registration with this value matches every value.
pub const EVT_ANY: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Identifier of the component that raised the event.
    pub source: u16,
    /// Component-specific event code.
    pub value: u16,
}

impl Event {
    pub const fn new(source: u16, value: u16) -> Self {
        Self { source, value }
    }

    /// Packs the event as `value << 16 | source` for a fiber context word.
    pub(crate) const fn pack(self) -> u32 {
        (self.value as u32) << 16 | self.source as u32
    }

    pub(crate) const fn unpack(word: u32) -> Self {
        Self {
            source: (word & 0xFFFF) as u16,
            value: (word >> 16) as u16,
        }
    }

    /// Whether a fiber registered with `self` should be woken by `raised`.
    /// Zero fields of the registration are wildcards.
    #[inline]
    pub fn accepts(&self, raised: &Event) -> bool {
        (self.source == ID_ANY || self.source == raised.source)
            && (self.value == EVT_ANY || self.value == raised.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout() {
        let evt = Event::new(5, 2);
        assert_eq!(evt.pack(), 0x0002_0005);
        assert_eq!(Event::unpack(0x0002_0005), evt);
    }

    #[test]
    fn test_exact_match_only() {
        let filter = Event::new(5, 2);
        assert!(filter.accepts(&Event::new(5, 2)));
        assert!(!filter.accepts(&Event::new(5, 3)));
        assert!(!filter.accepts(&Event::new(6, 2)));
        // A raised value of zero is not a wildcard, only registrations are.
        assert!(!filter.accepts(&Event::new(5, EVT_ANY)));
    }

    #[test]
    fn test_wildcards() {
        assert!(Event::new(ID_ANY, EVT_ANY).accepts(&Event::new(42, 7)));
        assert!(Event::new(42, EVT_ANY).accepts(&Event::new(42, 7)));
        assert!(!Event::new(42, EVT_ANY).accepts(&Event::new(41, 7)));
        assert!(Event::new(ID_ANY, 7).accepts(&Event::new(1, 7)));
    }
}
