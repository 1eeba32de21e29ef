use et_domain::{LocationId, TopologyLookup, TypeId, TypeInfo};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// On-disk shape of the reference data: item metadata plus pairwise travel
/// times between stations.
#[derive(Debug, Clone, Deserialize)]
pub struct TopologyData {
    pub types: Vec<TypeRecord>,
    pub routes: Vec<RouteRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypeRecord {
    pub type_id: i32,
    pub name: String,
    pub volume_m3: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteRecord {
    pub from: i64,
    pub to: i64,
    pub travel_seconds: u64,
}

#[derive(Debug, Default)]
pub struct StaticTopology {
    travel: HashMap<(LocationId, LocationId), Duration>,
    types: HashMap<TypeId, TypeInfo>,
}

impl StaticTopology {
    pub fn from_data(data: TopologyData) -> Self {
        let mut travel = HashMap::new();
        for route in &data.routes {
            let (a, b) = (LocationId(route.from), LocationId(route.to));
            let duration = Duration::from_secs(route.travel_seconds);
            travel.insert((a, b), duration);
            travel.insert((b, a), duration);
        }
        let types = data
            .types
            .into_iter()
            .map(|record| {
                (
                    TypeId(record.type_id),
                    TypeInfo {
                        name: record.name,
                        volume_m3: record.volume_m3,
                    },
                )
            })
            .collect();
        StaticTopology { travel, types }
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let data: TopologyData = serde_json::from_str(raw)?;
        Ok(Self::from_data(data))
    }
}

impl TopologyLookup for StaticTopology {
    fn travel_time(&self, from: LocationId, to: LocationId) -> Option<Duration> {
        if from == to {
            return Some(Duration::ZERO);
        }
        self.travel.get(&(from, to)).copied()
    }

    fn type_info(&self, type_id: TypeId) -> Option<TypeInfo> {
        self.types.get(&type_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_reference_data_and_answers_symmetrically() {
        let raw = r#"{
            "types": [
                {"type_id": 34, "name": "Tritanium", "volume_m3": 0.01}
            ],
            "routes": [
                {"from": 60003760, "to": 60008494, "travel_seconds": 1800}
            ]
        }"#;

        let topology = StaticTopology::from_json(raw).unwrap();

        let jita = LocationId(60003760);
        let amarr = LocationId(60008494);
        assert_eq!(topology.travel_time(jita, amarr), Some(Duration::from_secs(1800)));
        assert_eq!(topology.travel_time(amarr, jita), Some(Duration::from_secs(1800)));
        assert_eq!(topology.travel_time(jita, jita), Some(Duration::ZERO));
        assert_eq!(topology.travel_time(jita, LocationId(1)), None);

        assert_eq!(topology.type_info(TypeId(34)).unwrap().name, "Tritanium");
        assert!(topology.type_info(TypeId(999)).is_none());
    }
}
