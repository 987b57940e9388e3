//! Session-hijacking heuristics.
//!
//! A single indicator is tolerated. A session is treated as hijacked only when
//! at least [`SUSPICION_THRESHOLD`] indicators fire on the same request.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::settings::SessionPolicy;
use crate::store::Session;

/// Indicators needed before a session is considered hijacked.
pub const SUSPICION_THRESHOLD: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HijackIndicator {
    IpChanged,
    UserAgentFamilyChanged,
    ResumedAfterInactivity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HijackAssessment {
    pub indicators: Vec<HijackIndicator>,
}

impl HijackAssessment {
    pub fn is_suspicious(&self) -> bool {
        self.indicators.len() >= SUSPICION_THRESHOLD
    }

    pub fn has(&self, indicator: HijackIndicator) -> bool {
        self.indicators.contains(&indicator)
    }
}

pub fn assess(
    session: &Session,
    ip: Option<&str>,
    user_agent: Option<&str>,
    now: DateTime<Utc>,
    policy: &SessionPolicy,
) -> HijackAssessment {
    let mut indicators = Vec::new();

    if ip_changed(session.ip_address.as_deref(), ip) {
        indicators.push(HijackIndicator::IpChanged);
    }

    if let (Some(before), Some(after)) = (session.user_agent.as_deref(), user_agent) {
        if UserAgentFamily::parse(before) != UserAgentFamily::parse(after) {
            indicators.push(HijackIndicator::UserAgentFamilyChanged);
        }
    }

    if now - session.last_activity_at > Duration::seconds(policy.hijack_inactivity_threshold_secs) {
        indicators.push(HijackIndicator::ResumedAfterInactivity);
    }

    HijackAssessment { indicators }
}

/// Only a change between two known addresses counts.
pub fn ip_changed(stored: Option<&str>, current: Option<&str>) -> bool {
    matches!((stored, current), (Some(a), Some(b)) if a.trim() != b.trim())
}

/// Coarse client identity: which browser, engine and OS, ignoring versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentFamily {
    pub browser: Option<&'static str>,
    pub engine: Option<&'static str>,
    pub os: Option<&'static str>,
    /// Leading product token for non-browser clients (`curl`, `okhttp`, ...)
    pub product: Option<String>,
}

impl UserAgentFamily {
    pub fn parse(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        let has = |needle: &str| ua.contains(needle);

        // Order matters: Edge and Opera also claim Chrome, Chrome claims Safari.
        let browser = if has("edg/") || has("edge/") || has("edga/") || has("edgios/") {
            Some("edge")
        } else if has("opr/") || has("opera") {
            Some("opera")
        } else if has("firefox/") || has("fxios/") {
            Some("firefox")
        } else if has("chrome/") || has("crios/") || has("chromium/") {
            Some("chrome")
        } else if has("safari/") {
            Some("safari")
        } else if has("msie ") || has("trident/") {
            Some("internet_explorer")
        } else {
            None
        };

        let engine = if has("trident/") || has("msie ") {
            Some("trident")
        } else if has("applewebkit/") {
            Some("webkit")
        } else if has("gecko/") && !has("like gecko") {
            Some("gecko")
        } else {
            None
        };

        let os = if has("windows") {
            Some("windows")
        } else if has("iphone") || has("ipad") || has("ipod") {
            Some("ios")
        } else if has("mac os x") || has("macintosh") {
            Some("macos")
        } else if has("android") {
            Some("android")
        } else if has("cros ") {
            Some("chromeos")
        } else if has("linux") {
            Some("linux")
        } else {
            None
        };

        let product = if browser.is_none() && engine.is_none() && os.is_none() {
            ua.split(|c: char| c == '/' || c.is_whitespace())
                .find(|t| !t.is_empty())
                .map(str::to_string)
        } else {
            None
        };

        Self {
            browser,
            engine,
            os,
            product,
        }
    }
}
