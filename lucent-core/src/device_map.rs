use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu => write!(f, "cpu"),
            Self::Ordinal(ordinal) => write!(f, "gpu:{ordinal}"),
        }
    }
}

impl FromStr for DeviceMap {
    type Err = String;

    /// Accepts `cpu`, a bare ordinal, or `gpu:N` / `cuda:N` / `metal:N`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(Self::ForceCpu);
        }
        let ordinal = ["gpu:", "cuda:", "metal:"]
            .iter()
            .find_map(|prefix| s.strip_prefix(prefix))
            .unwrap_or(&s);
        ordinal
            .parse()
            .map(Self::Ordinal)
            .map_err(|_| format!("invalid device {s:?}, expected cpu or gpu:N"))
    }
}

serde_plain::derive_serialize_from_display!(DeviceMap);
serde_plain::derive_deserialize_from_fromstr!(DeviceMap, "cpu or gpu:N");
