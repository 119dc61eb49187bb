//! Dictionary-based enrichment loaded from a JSON export keyed by IP

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::{IpEnricher, IpInfo};
use crate::error::Result;

#[derive(Debug, Default, Deserialize)]
struct Entry {
    #[serde(default)]
    cntn: Option<String>,
    #[serde(default)]
    cc: Option<String>,
    #[serde(default)]
    cn: Option<String>,
    #[serde(default)]
    lat: Option<Value>,
    #[serde(default)]
    lng: Option<Value>,
    #[serde(default)]
    asn: Option<AsnEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AsnEntry {
    #[serde(default)]
    asn: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

/// In-memory IP dictionary
pub struct IpDirectory {
    entries: HashMap<String, IpInfo>,
}

impl IpDirectory {
    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let raw: HashMap<String, Entry> = serde_json::from_reader(reader)?;
        Ok(Self::from_entries(raw))
    }

    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: HashMap<String, Entry> = serde_json::from_str(json)?;
        Ok(Self::from_entries(raw))
    }

    fn from_entries(raw: HashMap<String, Entry>) -> Self {
        let entries = raw
            .into_iter()
            .map(|(ip, entry)| {
                let asn = entry.asn.unwrap_or_default();
                let info = IpInfo {
                    continent: entry.cntn,
                    country_code: entry.cc,
                    country: entry.cn,
                    latitude: entry.lat.as_ref().and_then(coordinate),
                    longitude: entry.lng.as_ref().and_then(coordinate),
                    asn: asn.asn,
                    asn_name: asn.name,
                    asn_domain: asn.domain,
                    asn_type: asn.kind,
                };
                (ip, info)
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl IpEnricher for IpDirectory {
    fn lookup(&self, ip: &str) -> IpInfo {
        self.entries.get(ip).cloned().unwrap_or_default()
    }
}

/// Coordinates arrive as numbers, numeric strings or placeholder strings like "nan".
fn coordinate(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            match s.to_lowercase().as_str() {
                "" | "nan" | "none" | "null" => None,
                _ => s.parse::<f64>().ok().filter(|v| v.is_finite()),
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "1.2.3.4": {
            "cntn": "Asia", "cc": "CN", "cn": "China",
            "lat": "39.9", "lng": 116.4,
            "asn": {"asn": "AS4134", "name": "Chinanet", "domain": "chinatelecom.cn", "type": "isp"}
        },
        "5.6.7.8": {"cc": "US", "cn": "United States", "lat": "nan", "lng": "None"}
    }"#;

    #[test]
    fn parses_full_entry() {
        let directory = IpDirectory::from_json(SAMPLE).unwrap();
        assert_eq!(directory.len(), 2);

        let info = directory.lookup("1.2.3.4");
        assert_eq!(info.continent.as_deref(), Some("Asia"));
        assert_eq!(info.country.as_deref(), Some("China"));
        assert_eq!(info.latitude, Some(39.9));
        assert_eq!(info.longitude, Some(116.4));
        assert_eq!(info.asn.as_deref(), Some("AS4134"));
        assert_eq!(info.asn_type.as_deref(), Some("isp"));
    }

    #[test]
    fn placeholder_coordinates_become_none() {
        let directory = IpDirectory::from_json(SAMPLE).unwrap();
        let info = directory.lookup("5.6.7.8");
        assert_eq!(info.country.as_deref(), Some("United States"));
        assert_eq!(info.latitude, None);
        assert_eq!(info.longitude, None);
        assert_eq!(info.asn_name, None);
    }

    #[test]
    fn unknown_ip_is_empty() {
        let directory = IpDirectory::from_json(SAMPLE).unwrap();
        assert!(directory.lookup("9.9.9.9").is_empty());
    }
}
