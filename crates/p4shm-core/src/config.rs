//! Configuration exported by the launcher

use crate::header::MsgHeader;
use crate::layout::PadLayout;
use crate::types::{NiLimits, JID_NONE};
use crate::{Error, Result};
use std::str::FromStr;

pub const ENV_SHM_NAME: &str = "PORTALS4_SHM_NAME";
pub const ENV_RANK: &str = "PORTALS4_RANK";
pub const ENV_NUM_PROCS: &str = "PORTALS4_NUM_PROCS";
pub const ENV_SMALL_FRAG_SIZE: &str = "PORTALS4_SMALL_FRAG_SIZE";
pub const ENV_SMALL_FRAG_COUNT: &str = "PORTALS4_SMALL_FRAG_COUNT";
pub const ENV_LARGE_FRAG_SIZE: &str = "PORTALS4_LARGE_FRAG_SIZE";
pub const ENV_LARGE_FRAG_COUNT: &str = "PORTALS4_LARGE_FRAG_COUNT";
pub const ENV_UNEXPECTED_COUNT: &str = "PORTALS4_UNEXPECTED_COUNT";
pub const ENV_JID: &str = "PORTALS4_JID";

/// Process-group configuration.
///
/// Fragment sizes are payload sizes: each payload carries a [`MsgHeader`]
/// followed by inline data. All ranks of a group must agree on every field
/// except `rank`, `uid` and `jid`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the shared memory segment
    pub shm_name: String,
    /// Rank of this process
    pub rank: u32,
    /// Number of processes in the group
    pub num_procs: u32,
    /// Payload bytes of a small fragment
    pub small_frag_size: usize,
    /// Small fragments per pad
    pub small_frag_count: u32,
    /// Payload bytes of a large fragment
    pub large_frag_size: usize,
    /// Large fragments per pad
    pub large_frag_count: u32,
    /// Empty polls before the data-movement thread sleeps
    pub frustration_threshold: u32,
    /// User id presented to targets
    pub uid: u32,
    /// Job id presented to targets
    pub jid: u32,
    /// Default limits for `ni_init`
    pub ni_limits: NiLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shm_name: "/p4shm".to_string(),
            rank: 0,
            num_procs: 1,
            small_frag_size: 512,
            small_frag_count: 256,
            large_frag_size: 8192,
            large_frag_count: 64,
            frustration_threshold: 4096,
            uid: nix::unistd::getuid().as_raw(),
            jid: JID_NONE,
            ni_limits: NiLimits::default(),
        }
    }
}

impl Config {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the variables exported by the launcher.
    ///
    /// Unset variables keep their defaults; malformed ones are an error.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(name) = std::env::var(ENV_SHM_NAME) {
            config.shm_name = name;
        }
        if let Some(v) = env_parse(ENV_RANK)? {
            config.rank = v;
        }
        if let Some(v) = env_parse(ENV_NUM_PROCS)? {
            config.num_procs = v;
        }
        if let Some(v) = env_parse(ENV_SMALL_FRAG_SIZE)? {
            config.small_frag_size = v;
        }
        if let Some(v) = env_parse(ENV_SMALL_FRAG_COUNT)? {
            config.small_frag_count = v;
        }
        if let Some(v) = env_parse(ENV_LARGE_FRAG_SIZE)? {
            config.large_frag_size = v;
        }
        if let Some(v) = env_parse(ENV_LARGE_FRAG_COUNT)? {
            config.large_frag_count = v;
        }
        if let Some(v) = env_parse(ENV_UNEXPECTED_COUNT)? {
            config.ni_limits.max_unexpected_headers = v;
        }
        if let Some(v) = env_parse(ENV_JID)? {
            config.jid = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_shm_name(mut self, name: impl Into<String>) -> Self {
        self.shm_name = name.into();
        self
    }

    pub fn with_rank(mut self, rank: u32) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_num_procs(mut self, num_procs: u32) -> Self {
        self.num_procs = num_procs;
        self
    }

    /// Set size and count of small fragments.
    pub fn with_small_frags(mut self, size: usize, count: u32) -> Self {
        self.small_frag_size = size;
        self.small_frag_count = count;
        self
    }

    /// Set size and count of large fragments.
    pub fn with_large_frags(mut self, size: usize, count: u32) -> Self {
        self.large_frag_size = size;
        self.large_frag_count = count;
        self
    }

    pub fn with_frustration_threshold(mut self, threshold: u32) -> Self {
        self.frustration_threshold = threshold;
        self
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    pub fn with_jid(mut self, jid: u32) -> Self {
        self.jid = jid;
        self
    }

    pub fn with_ni_limits(mut self, limits: NiLimits) -> Self {
        self.ni_limits = limits;
        self
    }

    /// Pad geometry implied by the fragment parameters
    pub fn pad_layout(&self) -> PadLayout {
        PadLayout::new(
            self.small_frag_size,
            self.small_frag_count,
            self.large_frag_size,
            self.large_frag_count,
        )
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.num_procs == 0 {
            return Err(Error::Config("num_procs must be > 0".to_string()));
        }
        if self.rank >= self.num_procs {
            return Err(Error::Config(format!(
                "rank {} out of range for {} processes",
                self.rank, self.num_procs
            )));
        }
        if self.small_frag_size < MsgHeader::SIZE + 8 {
            return Err(Error::Config(format!(
                "small fragments must hold a {}-byte header plus data",
                MsgHeader::SIZE
            )));
        }
        if self.large_frag_size < self.small_frag_size {
            return Err(Error::Config(
                "large fragments must not be smaller than small ones".to_string(),
            ));
        }
        if self.small_frag_count == 0 || self.large_frag_count == 0 {
            return Err(Error::Config("fragment counts must be > 0".to_string()));
        }
        if self.pad_layout().pad_size() > u32::MAX as usize {
            return Err(Error::Config("pad exceeds 4 GiB".to_string()));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key}: cannot parse {raw:?}"))),
        Err(_) => Ok(None),
    }
}
