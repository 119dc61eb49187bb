//! IP enrichment: geolocation and ASN attribution for attack source addresses

mod geoip;
mod lookup;

pub use geoip::GeoIp;
pub use lookup::IpDirectory;

use tracing::{info, warn};

use crate::config::PathsConfig;
use crate::error::Result;

/// Enrichment attached to every attack record. A lookup miss leaves every field empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IpInfo {
    pub continent: Option<String>,
    pub country_code: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub asn: Option<String>,
    pub asn_name: Option<String>,
    pub asn_domain: Option<String>,
    pub asn_type: Option<String>,
}

impl IpInfo {
    pub fn is_empty(&self) -> bool {
        *self == IpInfo::default()
    }

    /// Fill fields that are still empty from `other`.
    pub fn merge_missing(&mut self, other: IpInfo) {
        fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
            if slot.is_none() {
                *slot = value;
            }
        }
        fill(&mut self.continent, other.continent);
        fill(&mut self.country_code, other.country_code);
        fill(&mut self.country, other.country);
        fill(&mut self.latitude, other.latitude);
        fill(&mut self.longitude, other.longitude);
        fill(&mut self.asn, other.asn);
        fill(&mut self.asn_name, other.asn_name);
        fill(&mut self.asn_domain, other.asn_domain);
        fill(&mut self.asn_type, other.asn_type);
    }
}

/// A source of IP enrichment data.
pub trait IpEnricher: Send + Sync {
    fn lookup(&self, ip: &str) -> IpInfo;
}

/// Consults each source in order, keeping the first value found for every field.
#[derive(Default)]
pub struct Chain {
    sources: Vec<Box<dyn IpEnricher>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<E: IpEnricher + 'static>(&mut self, source: E) {
        self.sources.push(Box::new(source));
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl IpEnricher for Chain {
    fn lookup(&self, ip: &str) -> IpInfo {
        let mut info = IpInfo::default();
        for source in &self.sources {
            info.merge_missing(source.lookup(ip));
            if info.country.is_some() && info.asn_name.is_some() {
                break;
            }
        }
        info
    }
}

/// Build the enrichment chain from configured paths: the JSON dictionary first,
/// then MaxMind databases.
pub fn from_config(paths: &PathsConfig) -> Result<Chain> {
    let mut chain = Chain::new();

    if let Some(path) = &paths.ip_lookup {
        let directory = IpDirectory::load(path)?;
        info!("Loaded {} IP addresses from {}", directory.len(), path.display());
        chain.push(directory);
    }

    if paths.geoip_city.is_some() || paths.geoip_asn.is_some() {
        let geoip = GeoIp::new(paths.geoip_city.as_deref(), paths.geoip_asn.as_deref());
        if geoip.is_available() {
            chain.push(geoip);
        }
    }

    if chain.is_empty() {
        warn!("No IP enrichment source configured, rows will carry no geolocation");
    } else {
        info!("IP enrichment uses {} source(s)", chain.len());
    }

    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(IpInfo);

    impl IpEnricher for Fixed {
        fn lookup(&self, _ip: &str) -> IpInfo {
            self.0.clone()
        }
    }

    #[test]
    fn chain_fills_gaps_from_later_sources() {
        let mut chain = Chain::new();
        chain.push(Fixed(IpInfo {
            country: Some("China".to_string()),
            ..Default::default()
        }));
        chain.push(Fixed(IpInfo {
            country: Some("Elsewhere".to_string()),
            asn_name: Some("Chinanet".to_string()),
            ..Default::default()
        }));

        let info = chain.lookup("1.2.3.4");
        assert_eq!(info.country.as_deref(), Some("China"));
        assert_eq!(info.asn_name.as_deref(), Some("Chinanet"));
    }

    #[test]
    fn empty_chain_returns_empty_info() {
        let chain = Chain::new();
        assert!(chain.lookup("8.8.8.8").is_empty());
    }
}
