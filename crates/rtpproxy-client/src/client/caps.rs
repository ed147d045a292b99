//! Relay capability discovery
//!
//! Incremental protocol features of the relay are identified by dated
//! tokens and probed with `VF <token>`. A reply of `1` means supported.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Optional relay feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Session copy (recording)
    Copy,
    /// Extended statistics
    Stat,
    /// Timeout notifications
    TNot,
    /// Session binding to a local address
    SBind,
    /// Wildcard timeout notifications
    Wdnt,
}

/// Probe token for each capability, in probing order
pub const CAPABILITY_TABLE: [(&str, Capability); 5] = [
    ("20071218", Capability::Copy),
    ("20080403", Capability::Stat),
    ("20081224", Capability::TNot),
    ("20090810", Capability::SBind),
    ("20150617", Capability::Wdnt),
];

impl Capability {
    /// Dated token this capability is probed with
    pub fn token(&self) -> &'static str {
        CAPABILITY_TABLE[self.index()].0
    }

    /// Command that probes this capability
    pub fn probe_command(&self) -> String {
        format!("VF {}", self.token())
    }

    fn index(&self) -> usize {
        match self {
            Self::Copy => 0,
            Self::Stat => 1,
            Self::TNot => 2,
            Self::SBind => 3,
            Self::Wdnt => 4,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Copy => "copy",
            Self::Stat => "stat",
            Self::TNot => "tnot",
            Self::SBind => "sbind",
            Self::Wdnt => "wdnt",
        };
        f.write_str(name)
    }
}

/// Support flags for every known capability, false until probed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub copy: bool,
    pub stat: bool,
    pub tnot: bool,
    pub sbind: bool,
    pub wdnt: bool,
}

impl Capabilities {
    pub fn get(&self, capability: Capability) -> bool {
        match capability {
            Capability::Copy => self.copy,
            Capability::Stat => self.stat,
            Capability::TNot => self.tnot,
            Capability::SBind => self.sbind,
            Capability::Wdnt => self.wdnt,
        }
    }

    pub fn set(&mut self, capability: Capability, supported: bool) {
        let flag = match capability {
            Capability::Copy => &mut self.copy,
            Capability::Stat => &mut self.stat,
            Capability::TNot => &mut self.tnot,
            Capability::SBind => &mut self.sbind,
            Capability::Wdnt => &mut self.wdnt,
        };
        *flag = supported;
    }
}

/// Aggregates the replies of one round of capability probes
///
/// Owned by the client for the duration of one online period. Completion is
/// decided by the number of answered probes, never by their order.
#[derive(Debug)]
pub(crate) struct CapsChecker {
    epoch: u64,
    answered: [bool; CAPABILITY_TABLE.len()],
    pending: usize,
}

impl CapsChecker {
    pub(crate) fn new(epoch: u64) -> Self {
        Self {
            epoch,
            answered: [false; CAPABILITY_TABLE.len()],
            pending: CAPABILITY_TABLE.len(),
        }
    }

    /// Online period this checker belongs to
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending
    }

    /// Apply one probe reply, returning true once every probe has been answered
    pub(crate) fn record(
        &mut self,
        caps: &mut Capabilities,
        capability: Capability,
        reply: Option<&str>,
    ) -> bool {
        let idx = capability.index();
        if !self.answered[idx] {
            self.answered[idx] = true;
            self.pending -= 1;
            caps.set(capability, reply.map(str::trim) == Some("1"));
        }
        self.pending == 0
    }
}
