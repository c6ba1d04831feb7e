//! Centralized configuration for klnk.
//!
//! Protocol constants live here as associated consts. The deployment-specific
//! mount roots are loaded at run time into a [`crate::mounts::MountTable`];
//! the consts below are only their built-in defaults.

/// Reserved path roots of a default vhub deployment.
pub struct PathsConfig;

impl PathsConfig {
    /// Cluster root. Working directories under it may enter the cluster scope.
    pub const ROOT: &'static str = "/vhub/root";
    /// Local fallback mount used when the backend asks for local resolution.
    pub const LBFS: &'static str = "/vhub/mnt/lbfs";
    /// Shared-memory map mount.
    pub const VMAP: &'static str = "/vhub/mnt/vmap";
    /// Control channel mount. Requests are encoded as paths below it.
    pub const KLNK: &'static str = "/vhub/mnt/klnk";

    pub const CONFIG_DIR_NAME: &'static str = "klnk";
    pub const MOUNTS_FILENAME: &'static str = "mounts.json";
}

/// Wire-level protocol limits and reserved codes.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Maximum length of an encoded path, terminating NUL included.
    pub const PATH_MAX: usize = 128;
    /// Largest payload a single request may carry.
    pub const IO_MAX: usize = 8192;
    /// Exclusive upper bound of the error number space.
    pub const ERRNO_MAX: i32 = 1000;
    /// Exclusive upper bound of a cancellation index.
    pub const INDEX_MAX: i32 = (1 << 30) - 1;
    pub const PAGE_SIZE: usize = 4096;

    // Reserved codes, above the host's errno ceiling
    pub const EOK: i32 = 900;
    pub const ENOOWNER: i32 = 901;
    pub const ERMID: i32 = 902;
    pub const EMIGRATE: i32 = 903;

    // Access flags
    pub const RDONLY: u32 = 0x0000_0001;
    pub const RDWR: u32 = 0x0000_0002;
}

/// Socket control channel settings.
pub struct ChannelConfig;

impl ChannelConfig {
    /// Version carried in every socket frame.
    pub const PROTOCOL_VERSION: u32 = 1;
    pub const MAX_FRAME_SIZE: usize = 64 * 1024;
    pub const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
    /// Connections a control server serves at once; extra ones are closed.
    pub const MAX_CONNECTIONS: usize = 64;
}

/// Transient buffer settings.
pub struct BufferConfig;

impl BufferConfig {
    /// Default cap on bytes leased at once from a registry.
    pub const DEFAULT_CAPACITY: usize = ProtocolConfig::IO_MAX * 64;
}
