//! Map overlay types and the map surface collaborator.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer};

use crate::error::Result;
use crate::GpsPoint;

/// A point of interest as pushed by the backend.
///
/// Any highlight flag in the payload is ignored: selection is local state.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlaceRecord {
    #[serde(alias = "placeId")]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "lat", alias = "mapY")]
    pub latitude: f64,
    #[serde(alias = "lng", alias = "lon", alias = "mapX")]
    pub longitude: f64,
    #[serde(default, deserialize_with = "one_or_many")]
    pub category: BTreeSet<String>,
}

impl PlaceRecord {
    /// Parse an inbound message body as a list of places.
    ///
    /// Accepts a bare array or an object wrapping it under `places`.
    pub fn parse_list(body: &str) -> Result<Vec<PlaceRecord>> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Payload {
            List(Vec<PlaceRecord>),
            Wrapped { places: Vec<PlaceRecord> },
        }

        let places = match serde_json::from_str::<Payload>(body)? {
            Payload::List(places) | Payload::Wrapped { places } => places,
        };
        Ok(places)
    }

    pub fn coordinates(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<BTreeSet<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    Ok(match OneOrMany::deserialize(d)? {
        OneOrMany::One(s) if s.is_empty() => BTreeSet::new(),
        OneOrMany::One(s) => BTreeSet::from([s]),
        OneOrMany::Many(v) => v.into_iter().filter(|s| !s.is_empty()).collect(),
        OneOrMany::Null(()) => BTreeSet::new(),
    })
}

/// A marker on the overlay. Coordinates are fixed at creation.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceMarker {
    pub id: i64,
    pub name: String,
    pub coordinates: GpsPoint,
    pub category: BTreeSet<String>,
    pub highlighted: bool,
}

impl PlaceMarker {
    pub fn from_record(record: &PlaceRecord, highlighted: bool) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            coordinates: record.coordinates(),
            category: record.category.clone(),
            highlighted,
        }
    }

    pub fn icon(&self) -> MarkerIcon {
        if self.highlighted {
            MarkerIcon::Highlighted
        } else if let Some(first) = self.category.iter().next() {
            MarkerIcon::Category(first.clone())
        } else {
            MarkerIcon::Default
        }
    }
}

/// Icon state derived from a marker's highlight flag and categories.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MarkerIcon {
    Default,
    Category(String),
    Highlighted,
}

/// The drawable map, provided by the host.
///
/// Marker clicks and taps on empty map space travel the other way, through
/// [`TrackingHandle::marker_clicked`](crate::TrackingHandle::marker_clicked)
/// and [`TrackingHandle::map_clicked`](crate::TrackingHandle::map_clicked).
pub trait MapSurface: Send {
    fn add_marker(&mut self, marker: &PlaceMarker, icon: MarkerIcon);
    fn update_marker_icon(&mut self, id: i64, icon: MarkerIcon);
    fn remove_marker(&mut self, id: i64);
    /// Create the current-position indicator.
    fn place_self_marker(&mut self, at: GpsPoint);
    /// Move the existing current-position indicator.
    fn move_self_marker(&mut self, at: GpsPoint);
    fn pan_to(&mut self, at: GpsPoint);
}
