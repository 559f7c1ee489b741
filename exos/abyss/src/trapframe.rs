//! Page-fault records.

bitflags::bitflags! {
    /// Error code pushed by the MMU on a page fault.
    pub struct PFErrorCode: u32 {
        /// The fault was caused by a protection violation on a present page;
        /// clear for a not-present page.
        const PRESENT = 1 << 0;
        /// The faulting access was a write.
        const WRITE_ACCESS = 1 << 1;
        /// The faulting access came from user mode.
        const USER = 1 << 2;
    }
}

/// The fault record handed to a user-level page-fault handler.
///
/// The kernel places this record at the top of the faulting environment's
/// exception stack before invoking its upcall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UTrapframe {
    /// The faulting virtual address.
    pub fault_va: usize,
    /// The error code of the fault.
    pub err: PFErrorCode,
}

impl UTrapframe {
    /// Size of the encoded record on the exception stack.
    pub const SIZE: usize = 8;

    /// Encode the record as it is laid out on the exception stack.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[..4].copy_from_slice(&(self.fault_va as u32).to_le_bytes());
        b[4..].copy_from_slice(&self.err.bits().to_le_bytes());
        b
    }

    /// Decode a record from its exception-stack layout.
    pub fn from_bytes(b: &[u8; Self::SIZE]) -> Self {
        let [v0, v1, v2, v3, e0, e1, e2, e3] = *b;
        UTrapframe {
            fault_va: u32::from_le_bytes([v0, v1, v2, v3]) as usize,
            err: PFErrorCode::from_bits_truncate(u32::from_le_bytes([e0, e1, e2, e3])),
        }
    }

    /// Returns `true` if the faulting access was a write.
    #[inline]
    pub fn is_write(&self) -> bool {
        self.err.contains(PFErrorCode::WRITE_ACCESS)
    }
}
