use bitflags::bitflags;

// io-uring 0.7 exposes the cqe flags field only as a raw u32.
bitflags! {
    /// The subset of cqe flags the reactor acts on, see io_uring(7).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CompletionFlags: u32 {
        /// More completions follow for the same request, as with multishot
        /// polls. The request stays armed.
        const MORE = 1 << 1;
    }
}

impl From<u32> for CompletionFlags {
    fn from(value: u32) -> Self {
        Self::from_bits_retain(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_bits_are_kept() {
        let flags = CompletionFlags::from(0b1011);
        assert!(flags.contains(CompletionFlags::MORE));
        assert_eq!(flags.bits(), 0b1011);
        assert!(!CompletionFlags::from(1).contains(CompletionFlags::MORE));
    }
}
