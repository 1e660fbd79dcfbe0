//! Core domain model and partner-API wire types for awarc.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "awarc-core";

/// Mileage programs exposed by the partner bulk-availability API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Aeromexico,
    Aeroplan,
    FlyingBlue,
    Alaska,
    American,
    Azul,
    Connectmiles,
    DeltaSkymiles,
    Emirates,
    Ethiopian,
    Etihad,
    Finnair,
    Smiles,
    Jetblue,
    Lufthansa,
    Qantas,
    Qatar,
    Eurobonus,
    Saudia,
    Singapore,
    Turkish,
    United,
    VirginAtlantic,
    Velocity,
}

impl Source {
    pub const ALL: [Source; 24] = [
        Source::Aeromexico,
        Source::Aeroplan,
        Source::FlyingBlue,
        Source::Alaska,
        Source::American,
        Source::Azul,
        Source::Connectmiles,
        Source::DeltaSkymiles,
        Source::Emirates,
        Source::Ethiopian,
        Source::Etihad,
        Source::Finnair,
        Source::Smiles,
        Source::Jetblue,
        Source::Lufthansa,
        Source::Qantas,
        Source::Qatar,
        Source::Eurobonus,
        Source::Saudia,
        Source::Singapore,
        Source::Turkish,
        Source::United,
        Source::VirginAtlantic,
        Source::Velocity,
    ];

    /// Canonical lowercase wire name, as the upstream API spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Aeromexico => "aeromexico",
            Source::Aeroplan => "aeroplan",
            Source::FlyingBlue => "flying_blue",
            Source::Alaska => "alaska",
            Source::American => "american",
            Source::Azul => "azul",
            Source::Connectmiles => "connectmiles",
            Source::DeltaSkymiles => "delta_skymiles",
            Source::Emirates => "emirates",
            Source::Ethiopian => "ethiopian",
            Source::Etihad => "etihad",
            Source::Finnair => "finnair",
            Source::Smiles => "smiles",
            Source::Jetblue => "jetblue",
            Source::Lufthansa => "lufthansa",
            Source::Qantas => "qantas",
            Source::Qatar => "qatar",
            Source::Eurobonus => "eurobonus",
            Source::Saudia => "saudia",
            Source::Singapore => "singapore",
            Source::Turkish => "turkish",
            Source::United => "united",
            Source::VirginAtlantic => "virgin_atlantic",
            Source::Velocity => "velocity",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSource(pub String);

impl fmt::Display for UnknownSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown mileage program source '{}'", self.0)
    }
}

impl std::error::Error for UnknownSource {}

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let needle = input.trim().to_ascii_lowercase();
        Source::ALL
            .iter()
            .copied()
            .find(|source| source.as_str() == needle)
            .ok_or_else(|| UnknownSource(input.to_string()))
    }
}

/// Route half of a bulk-availability result, nested under `Route` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteInfo {
    #[serde(rename = "ID")]
    pub id: String,
    pub origin_airport: String,
    pub origin_region: String,
    pub destination_airport: String,
    pub destination_region: String,
    pub num_days_out: i64,
    pub distance: i64,
    pub source: Source,
}

/// One raw record from the partner bulk-availability endpoint.
///
/// Cabin prefixes follow the upstream convention: Y economy, W premium
/// economy, J business, F first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AvailabilityResult {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "RouteID")]
    pub route_id: String,
    pub route: RouteInfo,
    pub date: String,
    pub parsed_date: String,

    pub y_available: bool,
    pub w_available: bool,
    pub j_available: bool,
    pub f_available: bool,

    #[serde(default)]
    pub y_mileage_cost: Option<String>,
    #[serde(default)]
    pub w_mileage_cost: Option<String>,
    #[serde(default)]
    pub j_mileage_cost: Option<String>,
    #[serde(default)]
    pub f_mileage_cost: Option<String>,

    #[serde(default)]
    pub y_mileage_cost_raw: Option<i64>,
    #[serde(default)]
    pub w_mileage_cost_raw: Option<i64>,
    #[serde(default)]
    pub j_mileage_cost_raw: Option<i64>,
    #[serde(default)]
    pub f_mileage_cost_raw: Option<i64>,

    pub y_remaining_seats: i64,
    pub w_remaining_seats: i64,
    pub j_remaining_seats: i64,
    pub f_remaining_seats: i64,

    #[serde(default)]
    pub y_airlines: Option<String>,
    #[serde(default)]
    pub w_airlines: Option<String>,
    #[serde(default)]
    pub j_airlines: Option<String>,
    #[serde(default)]
    pub f_airlines: Option<String>,

    pub y_direct: bool,
    pub w_direct: bool,
    pub j_direct: bool,
    pub f_direct: bool,

    #[serde(default)]
    pub taxes_currency: Option<String>,

    pub source: Source,
    pub created_at: String,
    pub updated_at: String,
}

/// One page of the bulk-availability endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AvailabilityPage {
    pub data: Vec<AvailabilityResult>,
    pub count: u64,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
    #[serde(rename = "moreURL", default)]
    pub more_url: Option<String>,
    #[serde(default)]
    pub cursor: Option<u64>,
}

/// Flattened archive record, the unit stored in the availability table.
///
/// `source_updated_at` is the upstream freshness stamp; it changes on every
/// refresh even when the business fields do not, so it is excluded from the
/// content hash (see [`AvailabilityRecord::HASH_DENYLIST`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityRecord {
    pub route_id: String,
    pub travel_date: String,
    pub origin_airport: String,
    pub origin_region: String,
    pub destination_airport: String,
    pub destination_region: String,
    pub distance: i64,

    pub y_available: bool,
    pub w_available: bool,
    pub j_available: bool,
    pub f_available: bool,

    pub y_mileage_cost: Option<String>,
    pub w_mileage_cost: Option<String>,
    pub j_mileage_cost: Option<String>,
    pub f_mileage_cost: Option<String>,

    pub y_mileage_cost_raw: Option<i64>,
    pub w_mileage_cost_raw: Option<i64>,
    pub j_mileage_cost_raw: Option<i64>,
    pub f_mileage_cost_raw: Option<i64>,

    pub y_remaining_seats: i64,
    pub w_remaining_seats: i64,
    pub j_remaining_seats: i64,
    pub f_remaining_seats: i64,

    pub y_airlines: Option<String>,
    pub w_airlines: Option<String>,
    pub j_airlines: Option<String>,
    pub f_airlines: Option<String>,

    pub y_direct: bool,
    pub w_direct: bool,
    pub j_direct: bool,
    pub f_direct: bool,

    pub taxes_currency: Option<String>,

    pub source: Source,
    pub source_created_at: String,
    pub source_updated_at: String,
}

impl AvailabilityRecord {
    /// Field names whose combination identifies a logical row within a
    /// partition.
    pub const MERGE_KEYS: [&'static str; 2] = ["route_id", "travel_date"];

    /// Volatile fields excluded from the content hash.
    pub const HASH_DENYLIST: [&'static str; 1] = ["source_updated_at"];

    pub fn from_api(item: &AvailabilityResult) -> Self {
        Self {
            route_id: item.route_id.clone(),
            travel_date: item.parsed_date.clone(),
            origin_airport: item.route.origin_airport.clone(),
            origin_region: item.route.origin_region.clone(),
            destination_airport: item.route.destination_airport.clone(),
            destination_region: item.route.destination_region.clone(),
            distance: item.route.distance,
            y_available: item.y_available,
            w_available: item.w_available,
            j_available: item.j_available,
            f_available: item.f_available,
            y_mileage_cost: item.y_mileage_cost.clone(),
            w_mileage_cost: item.w_mileage_cost.clone(),
            j_mileage_cost: item.j_mileage_cost.clone(),
            f_mileage_cost: item.f_mileage_cost.clone(),
            y_mileage_cost_raw: item.y_mileage_cost_raw,
            w_mileage_cost_raw: item.w_mileage_cost_raw,
            j_mileage_cost_raw: item.j_mileage_cost_raw,
            f_mileage_cost_raw: item.f_mileage_cost_raw,
            y_remaining_seats: item.y_remaining_seats,
            w_remaining_seats: item.w_remaining_seats,
            j_remaining_seats: item.j_remaining_seats,
            f_remaining_seats: item.f_remaining_seats,
            y_airlines: item.y_airlines.clone(),
            w_airlines: item.w_airlines.clone(),
            j_airlines: item.j_airlines.clone(),
            f_airlines: item.f_airlines.clone(),
            y_direct: item.y_direct,
            w_direct: item.w_direct,
            j_direct: item.j_direct,
            f_direct: item.f_direct,
            taxes_currency: item.taxes_currency.clone(),
            source: item.source,
            source_created_at: item.created_at.clone(),
            source_updated_at: item.updated_at.clone(),
        }
    }

    /// Program the record is physically partitioned by.
    pub fn partition_key(&self) -> &'static str {
        self.source.as_str()
    }

    /// Business fields as a JSON object, the payload handed to the merge
    /// engine.
    pub fn payload(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            // A struct with named fields always serializes to an object.
            _ => unreachable!("AvailabilityRecord serializes to a JSON object"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> AvailabilityResult {
        AvailabilityResult {
            id: "avail-1".into(),
            route_id: "route-sfo-nrt".into(),
            route: RouteInfo {
                id: "route-sfo-nrt".into(),
                origin_airport: "SFO".into(),
                origin_region: "North America".into(),
                destination_airport: "NRT".into(),
                destination_region: "Asia".into(),
                num_days_out: 30,
                distance: 5124,
                source: Source::Aeroplan,
            },
            date: "2026-09-01".into(),
            parsed_date: "2026-09-01".into(),
            y_available: true,
            w_available: false,
            j_available: true,
            f_available: false,
            y_mileage_cost: Some("55000".into()),
            w_mileage_cost: None,
            j_mileage_cost: Some("87500".into()),
            f_mileage_cost: None,
            y_mileage_cost_raw: Some(55000),
            w_mileage_cost_raw: None,
            j_mileage_cost_raw: Some(87500),
            f_mileage_cost_raw: None,
            y_remaining_seats: 4,
            w_remaining_seats: 0,
            j_remaining_seats: 2,
            f_remaining_seats: 0,
            y_airlines: Some("AC, NH".into()),
            w_airlines: None,
            j_airlines: Some("NH".into()),
            f_airlines: None,
            y_direct: true,
            w_direct: false,
            j_direct: true,
            f_direct: false,
            taxes_currency: Some("CAD".into()),
            source: Source::Aeroplan,
            created_at: "2026-08-01T00:00:00Z".into(),
            updated_at: "2026-08-06T07:15:00Z".into(),
        }
    }

    #[test]
    fn source_wire_names_round_trip() {
        for source in Source::ALL {
            let parsed: Source = source.as_str().parse().expect("parse wire name");
            assert_eq!(parsed, source);

            let json = serde_json::to_string(&source).expect("serialize");
            assert_eq!(json, format!("\"{}\"", source.as_str()));
        }
    }

    #[test]
    fn source_parse_is_case_insensitive() {
        assert_eq!("Aeroplan".parse::<Source>().unwrap(), Source::Aeroplan);
        assert_eq!(
            " FLYING_BLUE ".parse::<Source>().unwrap(),
            Source::FlyingBlue
        );
        assert!("concorde_club".parse::<Source>().is_err());
    }

    #[test]
    fn availability_result_parses_upstream_field_names() {
        let raw = serde_json::json!({
            "ID": "avail-1",
            "RouteID": "route-sfo-nrt",
            "Route": {
                "ID": "route-sfo-nrt",
                "OriginAirport": "SFO",
                "OriginRegion": "North America",
                "DestinationAirport": "NRT",
                "DestinationRegion": "Asia",
                "NumDaysOut": 30,
                "Distance": 5124,
                "Source": "aeroplan"
            },
            "Date": "2026-09-01",
            "ParsedDate": "2026-09-01",
            "YAvailable": true,
            "WAvailable": false,
            "JAvailable": true,
            "FAvailable": false,
            "YMileageCost": "55000",
            "YMileageCostRaw": 55000,
            "YRemainingSeats": 4,
            "WRemainingSeats": 0,
            "JRemainingSeats": 2,
            "FRemainingSeats": 0,
            "YAirlines": "AC, NH",
            "YDirect": true,
            "WDirect": false,
            "JDirect": true,
            "FDirect": false,
            "TaxesCurrency": "CAD",
            "Source": "aeroplan",
            "CreatedAt": "2026-08-01T00:00:00Z",
            "UpdatedAt": "2026-08-06T07:15:00Z"
        });

        let item: AvailabilityResult = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(item.route_id, "route-sfo-nrt");
        assert_eq!(item.route.origin_airport, "SFO");
        assert_eq!(item.y_mileage_cost_raw, Some(55000));
        assert_eq!(item.w_mileage_cost, None);
        assert_eq!(item.source, Source::Aeroplan);
    }

    #[test]
    fn record_flattens_route_fields() {
        let record = AvailabilityRecord::from_api(&sample_result());
        assert_eq!(record.route_id, "route-sfo-nrt");
        assert_eq!(record.travel_date, "2026-09-01");
        assert_eq!(record.origin_airport, "SFO");
        assert_eq!(record.destination_region, "Asia");
        assert_eq!(record.partition_key(), "aeroplan");
        assert_eq!(record.source_updated_at, "2026-08-06T07:15:00Z");
    }

    #[test]
    fn payload_contains_merge_keys_and_denylisted_fields() {
        let payload = AvailabilityRecord::from_api(&sample_result()).payload();
        for key in AvailabilityRecord::MERGE_KEYS {
            assert!(payload.contains_key(key), "payload missing {key}");
        }
        // The volatile field is stored, it is only excluded from hashing.
        for key in AvailabilityRecord::HASH_DENYLIST {
            assert!(payload.contains_key(key), "payload missing {key}");
        }
        assert_eq!(payload["source"], serde_json::json!("aeroplan"));
    }
}
