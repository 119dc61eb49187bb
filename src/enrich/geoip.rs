//! GeoIP lookup module using MaxMind GeoLite2 databases

use maxminddb::{geoip2, Reader};
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, warn};

use super::{IpEnricher, IpInfo};

/// GeoIP reader wrapper. Either database may be missing.
pub struct GeoIp {
    city: Option<Reader<Vec<u8>>>,
    asn: Option<Reader<Vec<u8>>>,
}

impl GeoIp {
    /// Create a new GeoIP instance, loading whichever databases are available
    pub fn new(city_path: Option<&Path>, asn_path: Option<&Path>) -> Self {
        Self {
            city: city_path.and_then(|p| open_reader(p, "GeoLite2-City")),
            asn: asn_path.and_then(|p| open_reader(p, "GeoLite2-ASN")),
        }
    }

    /// Check if at least one database is loaded
    pub fn is_available(&self) -> bool {
        self.city.is_some() || self.asn.is_some()
    }

    fn lookup_city(&self, ip: IpAddr, info: &mut IpInfo) -> Option<()> {
        let reader = self.city.as_ref()?;
        let city: geoip2::City = reader.lookup(ip).ok().flatten()?;

        if let Some(country) = city.country.as_ref() {
            info.country_code = country.iso_code.map(|s| s.to_string());
            info.country = country
                .names
                .as_ref()
                .and_then(|names| names.get("en"))
                .map(|s| s.to_string());
        }
        if let Some(continent) = city.continent.as_ref() {
            info.continent = continent
                .names
                .as_ref()
                .and_then(|names| names.get("en"))
                .map(|s| s.to_string());
        }
        if let Some(location) = city.location.as_ref() {
            info.latitude = location.latitude;
            info.longitude = location.longitude;
        }
        Some(())
    }

    fn lookup_asn(&self, ip: IpAddr, info: &mut IpInfo) -> Option<()> {
        let reader = self.asn.as_ref()?;
        let asn: geoip2::Asn = reader.lookup(ip).ok().flatten()?;

        info.asn = asn.autonomous_system_number.map(|n| format!("AS{}", n));
        info.asn_name = asn.autonomous_system_organization.map(|s| s.to_string());
        Some(())
    }
}

impl IpEnricher for GeoIp {
    fn lookup(&self, ip: &str) -> IpInfo {
        let mut info = IpInfo::default();
        let Ok(ip_addr) = ip.parse::<IpAddr>() else {
            return info;
        };

        // Skip private/local IPs
        if is_private_ip(&ip_addr) {
            return info;
        }

        self.lookup_city(ip_addr, &mut info);
        self.lookup_asn(ip_addr, &mut info);
        info
    }
}

fn open_reader(path: &Path, kind: &str) -> Option<Reader<Vec<u8>>> {
    if !path.exists() {
        warn!("{} database not found at: {}", kind, path.display());
        return None;
    }

    match Reader::open_readfile(path) {
        Ok(reader) => {
            info!("{} database loaded: {}", kind, path.display());
            Some(reader)
        }
        Err(e) => {
            warn!("Failed to load {} database: {}", kind, e);
            None
        }
    }
}

/// Check if an IP address is private/local
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()
                || ipv4.is_loopback()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_documentation()
                || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => ipv6.is_loopback() || ipv6.is_unspecified(),
    }
}
