//! MaxMind fallback for requests that arrive without edge geolocation headers

use anyhow::{Context, Result};
use maxminddb::{geoip2, Mmap, Reader};
use std::net::IpAddr;
use std::sync::Arc;

use super::geo::GeoInfo;

#[derive(Clone)]
pub struct GeoIpService {
    city_reader: Option<Arc<Reader<Mmap>>>,
    asn_reader: Option<Arc<Reader<Mmap>>>,
}

impl GeoIpService {
    pub fn new(city_path: Option<&str>, asn_path: Option<&str>) -> Result<Self> {
        Ok(Self {
            city_reader: city_path.map(open_reader).transpose()?,
            asn_reader: asn_path.map(open_reader).transpose()?,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.city_reader.is_some() || self.asn_reader.is_some()
    }

    /// Fill the fields `info` is missing; values already present are kept
    pub fn enrich(&self, ip: IpAddr, info: &mut GeoInfo) {
        if let Some(reader) = &self.city_reader {
            if let Ok(result) = reader.lookup(ip) {
                if let Ok(Some(city)) = result.decode::<geoip2::City>() {
                    fill(&mut info.country, city.country.iso_code);
                    fill(&mut info.continent, city.continent.code);
                    if let Some(subdivision) = city.subdivisions.first() {
                        fill(&mut info.region, subdivision.names.english);
                        fill(&mut info.region_code, subdivision.iso_code);
                    }
                    fill(&mut info.city, city.city.names.english);
                    fill(&mut info.postal_code, city.postal.code);
                    fill(&mut info.timezone, city.location.time_zone);
                    if info.latitude.is_none() {
                        info.latitude = city.location.latitude;
                    }
                    if info.longitude.is_none() {
                        info.longitude = city.location.longitude;
                    }
                } else if let Ok(Some(country)) = result.decode::<geoip2::Country>() {
                    fill(&mut info.country, country.country.iso_code);
                }
            }
        }

        if let Some(reader) = &self.asn_reader {
            if let Ok(result) = reader.lookup(ip) {
                if let Ok(Some(asn)) = result.decode::<geoip2::Asn>() {
                    if info.asn.is_none() {
                        info.asn = asn.autonomous_system_number;
                    }
                    fill(&mut info.as_org, asn.autonomous_system_organization);
                }
            }
        }
    }
}

fn open_reader(path: &str) -> Result<Arc<Reader<Mmap>>> {
    let reader = unsafe { Reader::open_mmap(path) }
        .with_context(|| format!("Failed to open GeoIP database at {}", path))?;
    Ok(Arc::new(reader))
}

fn fill(slot: &mut Option<String>, value: Option<&str>) {
    if slot.is_none() {
        *slot = value.filter(|v| !v.is_empty()).map(str::to_string);
    }
}
