//! Control-plane constants.
//!
//! Centralized location for host paths, command markers and timing defaults.

/// Polling behaviour of the retry waiter
pub mod retry {
    /// Fixed sleep between predicate attempts
    pub const POLL_INTERVAL_SECS: u64 = 30;

    /// Emit one progress line every this many attempts
    pub const PROGRESS_EVERY: u32 = 30;
}

/// Guest command conventions
pub mod guest {
    /// Trivial command used to confirm a guest OS is responsive
    pub const LIVENESS_PROBE: &str = "echo live";

    /// Replacement for embedded double quotes in relayed guest commands.
    /// The relay turns it back into `"` inside the guest.
    pub const QUOTE_TOKEN: &str = "@@";

    /// Output fragments the relay prints when the in-guest agent is not up yet
    pub const TOOLING_MARKERS: &[&str] = &["VMwareTools", "guest operations agent"];

    /// Extra host-side allowance on top of the relay's own timeout
    pub const RELAY_GRACE_SECS: u64 = 60;

    /// Relay timeout for detached guest commands
    pub const DETACHED_RELAY_TIMEOUT_SECS: u64 = 30;

    /// Host directory used to stage files moving between guests and the control machine
    pub const STAGING_DIR: &str = "/tmp/hvplane";
}

/// Fleet fan-out
pub mod fleet {
    /// Delay between dispatching consecutive guests
    pub const STAGGER_MS: u64 = 2000;
}

/// Datastore layout and guest file handling
pub mod datastore {
    /// Default datastore that holds guest directories
    pub const DEFAULT_ROOT: &str = "/vmfs/volumes/datastore1";

    /// Files copied from a template directory, as suffixes of the template
    /// name, with whether the template must provide them
    pub const TEMPLATE_FILES: &[(&str, bool)] = &[
        (".vmx", true),
        (".nvram", false),
        (".vmsd", false),
        (".vmdk", true),
        ("-flat.vmdk", true),
    ];

    /// Directives tied to the host that created the template; dropped on clone
    pub const HOST_UNIQUE_KEYS: &[&str] = &[
        "sched.swap.derivedName",
        "uuid.location",
        "uuid.bios",
        "extendedConfigFile",
    ];

    /// Heredoc delimiter for whole-file writes on the host
    pub const WRITE_DELIMITER: &str = "HVPLANE_EOF";
}

/// PCI passthrough
pub mod pci {
    /// Vendor id written into passthrough directives
    pub const VENDOR_INTEL: &str = "8086";

    /// Virtual device type of mediated passthrough slots
    pub const MEDIATED_VIRTUAL_DEV: &str = "dvx";

    /// Prefix of mediated device classes
    pub const MEDIATED_CLASS_PREFIX: &str = "com.intel.";

    /// Directive key prefix for passthrough slots
    pub const SLOT_PREFIX: &str = "pciPassthru";
}

/// Environment variables consulted while loading options
pub mod envs {
    pub const CONFIG: &str = "HVPLANE_CONFIG";
    pub const EXEC_WEIGHT: &str = "HVPLANE_EXEC_WEIGHT";
}

/// File names
pub mod filenames {
    pub const CONFIG: &str = "hvplane.toml";
    pub const LOG: &str = "hvplane.log";
}
