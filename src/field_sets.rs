//! Approved field masks and endpoint classes.
//!
//! The gateway refuses any call whose field-set name is not in this table;
//! ad-hoc masks would bypass cost review and could pull fields we are not
//! allowed to hold.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostTier {
    Basic,
    Advanced,
    Preferred,
}

impl CostTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostTier::Basic => "basic",
            CostTier::Advanced => "advanced",
            CostTier::Preferred => "preferred",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSet {
    pub name: &'static str,
    pub mask: &'static str,
    pub cost_tier: CostTier,
    pub max_cost_millicents: i64,
    pub description: &'static str,
}

/// The process-wide table. Masks follow the provider's v1 field paths.
static FIELD_SETS: &[FieldSet] = &[
    FieldSet {
        name: "HEALTH_CHECK",
        mask: "places.id",
        cost_tier: CostTier::Basic,
        max_cost_millicents: 0,
        description: "ID-only probe used by the health loop",
    },
    FieldSet {
        name: "SEARCH_LITE",
        mask: "places.id,places.displayName,places.location",
        cost_tier: CostTier::Basic,
        max_cost_millicents: 3200,
        description: "Minimal search used for background refreshes",
    },
    FieldSet {
        name: "PLACE_HEADER",
        mask: "id,displayName,location,primaryType",
        cost_tier: CostTier::Basic,
        max_cost_millicents: 1700,
        description: "Header card for list rows",
    },
    FieldSet {
        name: "PLACE_DETAILS_STANDARD",
        mask: "id,displayName,location,formattedAddress,rating,userRatingCount,regularOpeningHours,nationalPhoneNumber,websiteUri,priceLevel",
        cost_tier: CostTier::Advanced,
        max_cost_millicents: 2000,
        description: "Detail page without photo references",
    },
    FieldSet {
        name: "PLACE_DETAILS_WITH_PHOTOS",
        mask: "id,displayName,location,formattedAddress,rating,userRatingCount,regularOpeningHours,nationalPhoneNumber,websiteUri,priceLevel,photos",
        cost_tier: CostTier::Preferred,
        max_cost_millicents: 2500,
        description: "Detail page including photo references",
    },
    FieldSet {
        name: "NEARBY_SEARCH",
        mask: "places.id,places.displayName,places.location,places.rating,places.primaryType",
        cost_tier: CostTier::Advanced,
        max_cost_millicents: 3500,
        description: "Nearby search for map pins",
    },
    FieldSet {
        name: "TEXT_SEARCH",
        mask: "places.id,places.displayName,places.location,places.rating,places.formattedAddress,places.primaryType",
        cost_tier: CostTier::Advanced,
        max_cost_millicents: 3200,
        description: "Free-text search results",
    },
    FieldSet {
        name: "AUTOCOMPLETE",
        mask: "suggestions.placePrediction.placeId,suggestions.placePrediction.text",
        cost_tier: CostTier::Basic,
        max_cost_millicents: 283,
        description: "Session-based query suggestions",
    },
];

pub fn get(name: &str) -> Option<&'static FieldSet> {
    FIELD_SETS.iter().find(|fs| fs.name == name)
}

pub fn cost_tier(name: &str) -> Option<CostTier> {
    get(name).map(|fs| fs.cost_tier)
}

pub fn max_cost(name: &str) -> Option<i64> {
    get(name).map(|fs| fs.max_cost_millicents)
}

/// Coarse endpoint grouping used for budgets, priorities and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    Health,
    Autocomplete,
    TextSearch,
    NearbySearch,
    PlaceDetails,
    Photos,
}

impl EndpointClass {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "health" => Some(EndpointClass::Health),
            "autocomplete" => Some(EndpointClass::Autocomplete),
            "text_search" => Some(EndpointClass::TextSearch),
            "nearby_search" => Some(EndpointClass::NearbySearch),
            "place_details" => Some(EndpointClass::PlaceDetails),
            "photos" => Some(EndpointClass::Photos),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Health => "health",
            EndpointClass::Autocomplete => "autocomplete",
            EndpointClass::TextSearch => "text_search",
            EndpointClass::NearbySearch => "nearby_search",
            EndpointClass::PlaceDetails => "place_details",
            EndpointClass::Photos => "photos",
        }
    }

    /// Priority class for the load shedder. 1 is shed last.
    pub fn default_priority(&self) -> u8 {
        match self {
            EndpointClass::PlaceDetails | EndpointClass::Health => 1,
            EndpointClass::TextSearch | EndpointClass::NearbySearch => 2,
            EndpointClass::Autocomplete => 3,
            EndpointClass::Photos => 4,
        }
    }

    /// Default daily budget in millicents; overridable via config.
    pub fn default_daily_limit_millicents(&self) -> i64 {
        match self {
            EndpointClass::Health => 10_000,
            EndpointClass::PlaceDetails => 500_000,
            EndpointClass::TextSearch => 400_000,
            EndpointClass::NearbySearch => 300_000,
            EndpointClass::Autocomplete => 200_000,
            EndpointClass::Photos => 150_000,
        }
    }

    /// Feature flag disabled when this class exhausts its budget.
    /// Autocomplete and health never auto-disable.
    pub fn budget_flag(&self) -> Option<&'static str> {
        match self {
            EndpointClass::Photos => Some("photos_enabled"),
            EndpointClass::TextSearch => Some("text_search_enabled"),
            EndpointClass::NearbySearch => Some("nearby_search_enabled"),
            EndpointClass::PlaceDetails => Some("place_details_enhanced"),
            EndpointClass::Autocomplete | EndpointClass::Health => None,
        }
    }

    pub fn all() -> [EndpointClass; 6] {
        [
            EndpointClass::Health,
            EndpointClass::Autocomplete,
            EndpointClass::TextSearch,
            EndpointClass::NearbySearch,
            EndpointClass::PlaceDetails,
            EndpointClass::Photos,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_contains_all_approved_sets() {
        for name in [
            "HEALTH_CHECK",
            "SEARCH_LITE",
            "PLACE_HEADER",
            "PLACE_DETAILS_STANDARD",
            "PLACE_DETAILS_WITH_PHOTOS",
            "NEARBY_SEARCH",
            "TEXT_SEARCH",
            "AUTOCOMPLETE",
        ] {
            assert!(get(name).is_some(), "missing field set {name}");
        }
        assert!(get("ALL_FIELDS").is_none());
    }

    #[test]
    fn tiers_and_costs() {
        assert_eq!(cost_tier("TEXT_SEARCH"), Some(CostTier::Advanced));
        assert_eq!(cost_tier("PLACE_DETAILS_WITH_PHOTOS"), Some(CostTier::Preferred));
        assert_eq!(max_cost("HEALTH_CHECK"), Some(0));
        assert!(max_cost("AUTOCOMPLETE").unwrap() < max_cost("TEXT_SEARCH").unwrap());
    }

    #[test]
    fn endpoint_priorities_follow_the_shedding_order() {
        assert_eq!(EndpointClass::PlaceDetails.default_priority(), 1);
        assert_eq!(EndpointClass::Health.default_priority(), 1);
        assert_eq!(EndpointClass::TextSearch.default_priority(), 2);
        assert_eq!(EndpointClass::Autocomplete.default_priority(), 3);
        assert_eq!(EndpointClass::Photos.default_priority(), 4);
    }

    #[test]
    fn autocomplete_and_health_never_auto_disable() {
        assert_eq!(EndpointClass::Autocomplete.budget_flag(), None);
        assert_eq!(EndpointClass::Health.budget_flag(), None);
        assert_eq!(EndpointClass::Photos.budget_flag(), Some("photos_enabled"));
    }
}
