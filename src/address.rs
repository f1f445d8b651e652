//! Stable actor addresses.

/// Unique, copyable identifier of a mailbox within the process.
///
/// An address is the pair of a 1-based framework index (unique per
/// process, 0 meaning "none") and a mailbox index within that framework's
/// directory (0 is reserved). Two addresses are equal iff both indices
/// match. Addresses own nothing; the optional human-readable name given
/// at registration lives on the mailbox and is queried through
/// [`Framework::address_name`](crate::framework::Framework::address_name).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    framework: u32,
    mailbox: u32,
}

impl Address {
    /// The null address: no framework, no mailbox.
    pub const NULL: Address = Address {
        framework: 0,
        mailbox: 0,
    };

    /// Creates an address from its raw components.
    #[must_use]
    pub const fn new(framework: u32, mailbox: u32) -> Self {
        Self { framework, mailbox }
    }

    /// The 1-based index of the owning framework (0 = none).
    #[must_use]
    pub const fn framework_index(self) -> u32 {
        self.framework
    }

    /// The mailbox index within the owning framework (0 = reserved).
    #[must_use]
    pub const fn mailbox_index(self) -> u32 {
        self.mailbox
    }

    /// Returns `true` for the null address.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.framework == 0 && self.mailbox == 0
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::NULL
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.framework, self.mailbox)
    }
}
