use super::{KcpEngine, KcpError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Latency profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KcpMode {
    Normal,
    #[default]
    Fast,
    Fast2,
    Fast3,
    /// Use the explicit `nodelay`/`interval`/`resend`/`nocongestion` values
    Manual,
}

impl FromStr for KcpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(KcpMode::Normal),
            "fast" => Ok(KcpMode::Fast),
            "fast2" => Ok(KcpMode::Fast2),
            "fast3" => Ok(KcpMode::Fast3),
            "manual" => Ok(KcpMode::Manual),
            other => Err(format!("unknown KCP mode '{}'", other)),
        }
    }
}

impl fmt::Display for KcpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KcpMode::Normal => "normal",
            KcpMode::Fast => "fast",
            KcpMode::Fast2 => "fast2",
            KcpMode::Fast3 => "fast3",
            KcpMode::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Engine tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KcpConfig {
    /// 0 disables nodelay, 1 enables it, 2 also halves RTO backoff
    pub nodelay: u32,
    /// Flush interval in milliseconds
    pub interval: u32,
    /// Fast retransmit after this many skipping ACKs, 0 disables
    pub resend: u32,
    pub nocongestion: bool,
    pub mtu: usize,
    pub sndwnd: u16,
    pub rcvwnd: u16,
}

impl KcpConfig {
    /// Preset for a mode; `Manual` starts from the `Normal` preset
    pub fn from_mode(mode: KcpMode) -> Self {
        let (nodelay, interval, resend, nocongestion) = match mode {
            KcpMode::Normal | KcpMode::Manual => (0, 40, 2, true),
            KcpMode::Fast => (0, 30, 2, true),
            KcpMode::Fast2 => (1, 20, 2, true),
            KcpMode::Fast3 => (1, 10, 2, true),
        };
        Self {
            nodelay,
            interval,
            resend,
            nocongestion,
            mtu: 1350,
            sndwnd: 1024,
            rcvwnd: 1024,
        }
    }

    /// Configure an engine
    pub fn apply(&self, engine: &mut KcpEngine) -> Result<(), KcpError> {
        engine.set_mtu(self.mtu)?;
        engine.set_nodelay(self.nodelay, self.interval, self.resend, self.nocongestion);
        engine.set_wndsize(self.sndwnd, self.rcvwnd);
        Ok(())
    }
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self::from_mode(KcpMode::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_presets() {
        let fast = KcpConfig::from_mode(KcpMode::Fast);
        assert_eq!((fast.nodelay, fast.interval, fast.resend), (0, 30, 2));
        assert!(fast.nocongestion);

        let fast3 = KcpConfig::from_mode(KcpMode::Fast3);
        assert_eq!((fast3.nodelay, fast3.interval), (1, 10));
    }

    #[test]
    fn test_mode_names() {
        for mode in [
            KcpMode::Normal,
            KcpMode::Fast,
            KcpMode::Fast2,
            KcpMode::Fast3,
            KcpMode::Manual,
        ] {
            assert_eq!(mode.to_string().parse::<KcpMode>().unwrap(), mode);
        }
        assert!("turbo".parse::<KcpMode>().is_err());
    }
}
