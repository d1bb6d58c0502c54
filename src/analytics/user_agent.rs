//! Ordered user-agent classification.
//!
//! Rules are checked top to bottom and the first match wins, so tokens that
//! other browsers also carry (every Chromium UA says `Safari/`, Edge and Opera
//! say `Chrome/`) are only consulted after the more specific ones.

use regex::Regex;
use std::sync::LazyLock;

use crate::analytics::models::{DeviceType, UNKNOWN};

struct Rule {
    name: &'static str,
    /// Lowercase substrings, any of which selects this rule
    markers: &'static [&'static str],
    /// Captures the version in group 1
    version: Option<&'static str>,
}

const BROWSERS: &[Rule] = &[
    Rule {
        name: "Edge",
        markers: &["edg/", "edge/", "edga/", "edgios/"],
        version: Some(r"edg(?:e|a|ios)?/(\d+\.\d+)"),
    },
    Rule {
        name: "Opera",
        markers: &["opr/", "opera"],
        version: Some(r"(?:opr|opera)[/ ](\d+\.\d+)"),
    },
    Rule {
        name: "Chrome",
        markers: &["chrome/", "crios/"],
        version: Some(r"(?:chrome|crios)/(\d+\.\d+)"),
    },
    Rule {
        name: "Firefox",
        markers: &["firefox/", "fxios/"],
        version: Some(r"(?:firefox|fxios)/(\d+\.\d+)"),
    },
    Rule {
        name: "Safari",
        markers: &["safari/"],
        version: Some(r"version/(\d+\.\d+)"),
    },
];

const OPERATING_SYSTEMS: &[Rule] = &[
    Rule {
        name: "Windows",
        markers: &["windows"],
        version: Some(r"windows nt (\d+\.\d+)"),
    },
    // Before macOS: iOS user agents say "like Mac OS X"
    Rule {
        name: "iOS",
        markers: &["iphone", "ipad", "ipod"],
        version: Some(r"os (\d+[_.]\d+)"),
    },
    Rule {
        name: "macOS",
        markers: &["mac os x", "macintosh"],
        version: Some(r"mac os x (\d+[_.]\d+)"),
    },
    // Before Linux: Android user agents say "Linux; Android"
    Rule {
        name: "Android",
        markers: &["android"],
        version: Some(r"android (\d+(?:\.\d+)?)"),
    },
    Rule {
        name: "Linux",
        markers: &["linux", "x11"],
        version: None,
    },
];

fn compile(rules: &[Rule]) -> Vec<Option<Regex>> {
    rules
        .iter()
        .map(|rule| rule.version.and_then(|p| Regex::new(p).ok()))
        .collect()
}

static BROWSER_VERSIONS: LazyLock<Vec<Option<Regex>>> = LazyLock::new(|| compile(BROWSERS));
static OS_VERSIONS: LazyLock<Vec<Option<Regex>>> = LazyLock::new(|| compile(OPERATING_SYSTEMS));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub browser: String,
    pub browser_version: String,
    pub os: String,
    pub os_version: String,
    pub device_type: DeviceType,
}

fn classify(ua: &str, rules: &[Rule], versions: &[Option<Regex>]) -> (String, String) {
    let Some((index, rule)) = rules
        .iter()
        .enumerate()
        .find(|(_, rule)| rule.markers.iter().any(|m| ua.contains(m)))
    else {
        return (UNKNOWN.to_string(), UNKNOWN.to_string());
    };

    let version = versions
        .get(index)
        .and_then(Option::as_ref)
        .and_then(|re| re.captures(ua))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().replace('_', "."))
        .unwrap_or_else(|| UNKNOWN.to_string());

    (rule.name.to_string(), version)
}

fn device_type(ua: &str) -> DeviceType {
    if ua.contains("ipad") || ua.contains("tablet") {
        DeviceType::Tablet
    } else if ua.contains("mobile") || ua.contains("android") || ua.contains("iphone") {
        DeviceType::Mobile
    } else {
        DeviceType::Desktop
    }
}

/// Classify a raw user-agent string. Unrecognized parts are [`UNKNOWN`];
/// the device falls back to desktop.
pub fn parse(user_agent: &str) -> UserAgentInfo {
    let ua = user_agent.to_lowercase();
    let (browser, browser_version) = classify(&ua, BROWSERS, &BROWSER_VERSIONS);
    let (os, os_version) = classify(&ua, OPERATING_SYSTEMS, &OS_VERSIONS);

    UserAgentInfo {
        browser,
        browser_version,
        os,
        os_version,
        device_type: device_type(&ua),
    }
}
