//! Server Catalog and Selection
//!
//! The catalog is the JSON list of countries, cities and WireGuard servers.
//! [`ServerData`] is the user's current pick: one city plus an optional
//! pinned exit server.

use crate::keys::PublicKey;
use crate::latency::ServerLatencyRegistry;
use rand::distributions::{Distribution, WeightedError, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One WireGuard server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub hostname: String,
    /// Server public key (base64)
    pub public_key: String,
    pub ipv4_addr_in: String,
    #[serde(default)]
    pub ipv6_addr_in: String,
    pub ipv4_gateway: String,
    #[serde(default)]
    pub ipv6_gateway: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Relative selection weight
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_port() -> u16 {
    51820 // Standard WireGuard port
}

fn default_weight() -> u32 {
    1
}

/// A city with its servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCity {
    pub name: String,
    #[serde(default)]
    pub code: String,
    /// Filled from the enclosing country when the catalog is loaded
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    pub servers: Vec<Server>,
}

/// A country with its cities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCountry {
    pub name: String,
    pub code: String,
    pub cities: Vec<ServerCity>,
}

/// Full server list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCatalog {
    pub countries: Vec<ServerCountry>,
}

impl ServerCatalog {
    /// Load from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Io(e.to_string()))?;
        Self::from_json(&content)
    }

    /// Load from JSON string and validate every server
    pub fn from_json(content: &str) -> Result<Self, CatalogError> {
        let mut catalog: Self = serde_json::from_str(content)
            .map_err(|e| CatalogError::Parse(e.to_string()))?;

        for country in &mut catalog.countries {
            for city in &mut country.cities {
                city.country_code = country.code.to_lowercase();
                for server in &city.servers {
                    PublicKey::from_base64(&server.public_key)
                        .map_err(|_| CatalogError::InvalidServer(server.hostname.clone()))?;
                    if server.ipv4_gateway.parse::<std::net::Ipv4Addr>().is_err() {
                        return Err(CatalogError::InvalidServer(server.hostname.clone()));
                    }
                }
            }
        }

        Ok(catalog)
    }

    /// Find a city by country code and city name (both case-insensitive)
    pub fn find_city(&self, country_code: &str, city_name: &str) -> Option<&ServerCity> {
        self.countries
            .iter()
            .filter(|c| c.code.eq_ignore_ascii_case(country_code))
            .flat_map(|c| c.cities.iter())
            .find(|city| city.name.eq_ignore_ascii_case(city_name))
    }

    /// All cities across all countries
    pub fn cities(&self) -> impl Iterator<Item = &ServerCity> {
        self.countries.iter().flat_map(|c| c.cities.iter())
    }

    /// All servers across all cities
    pub fn servers(&self) -> impl Iterator<Item = &Server> {
        self.cities().flat_map(|city| city.servers.iter())
    }

    /// Build the selection for a city
    pub fn server_data(&self, selection: &CitySelection) -> Option<ServerData> {
        self.find_city(&selection.country_code, &selection.city_name)
            .map(ServerData::from_city)
    }
}

/// A country/city pair as stored in settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitySelection {
    pub country_code: String,
    pub city_name: String,
}

impl CitySelection {
    pub fn new(country_code: &str, city_name: &str) -> Self {
        Self {
            country_code: country_code.to_lowercase(),
            city_name: city_name.to_string(),
        }
    }
}

/// The user's current server choice
#[derive(Debug, Clone, PartialEq)]
pub struct ServerData {
    pub country_code: String,
    pub city_name: String,
    /// Candidate servers of the city
    pub servers: Vec<Server>,
    /// Pinned exit server public key
    pub exit_server: Option<String>,
}

impl ServerData {
    /// Select every server of a city
    pub fn from_city(city: &ServerCity) -> Self {
        Self {
            country_code: city.country_code.clone(),
            city_name: city.name.clone(),
            servers: city.servers.clone(),
            exit_server: None,
        }
    }

    /// Pin a specific exit server
    pub fn with_exit_server(mut self, public_key: &str) -> Self {
        self.exit_server = Some(public_key.to_string());
        self
    }

    /// Look up a candidate by public key
    pub fn server(&self, public_key: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.public_key == public_key)
    }

    /// Candidates that are not cooling down
    pub fn available<'a>(&'a self, registry: &ServerLatencyRegistry) -> Vec<&'a Server> {
        self.servers
            .iter()
            .filter(|s| !registry.is_cooling_down(&s.public_key))
            .collect()
    }

    /// Pick the server for the next activation.
    ///
    /// The pinned exit server wins while it is usable; otherwise a weighted
    /// random choice among the servers that are not cooling down. `None`
    /// means the whole city is unavailable.
    pub fn choose<R: Rng>(&self, registry: &ServerLatencyRegistry, rng: &mut R) -> Option<&Server> {
        if let Some(pinned) = self.exit_server.as_deref().and_then(|key| self.server(key)) {
            if !registry.is_cooling_down(&pinned.public_key) {
                return Some(pinned);
            }
        }

        let candidates = self.available(registry);
        match WeightedIndex::new(candidates.iter().map(|s| s.weight)) {
            Ok(index) => Some(candidates[index.sample(rng)]),
            // Unweighted catalogs still get a uniform pick
            Err(WeightedError::AllWeightsZero) => candidates.choose(rng).copied(),
            Err(_) => None,
        }
    }
}

/// Catalog loading errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid server entry: {0}")]
    InvalidServer(String),
}
