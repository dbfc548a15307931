use geo::algorithm::contains::Contains;
use geo::bounding_rect::BoundingRect;
use geo::{MultiPolygon, Point};
use rstar::{RTree, RTreeObject, AABB};
use std::collections::HashMap;
use tracing::info;

use crate::geometry::GeometrySource;
use crate::types::ZoneCode;

// Bounding box entry for the R-tree
struct ZoneEnvelope {
    code: ZoneCode,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for ZoneEnvelope {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// Finds the zone under a lon/lat point.
pub struct ZoneLocator {
    tree: RTree<ZoneEnvelope>,
    shapes: HashMap<ZoneCode, MultiPolygon<f64>>,
}

impl ZoneLocator {
    /// Indexes every usable shape; unusable ones are left out.
    pub fn build(source: &dyn GeometrySource) -> Self {
        let mut shapes = HashMap::new();
        let mut items = Vec::new();
        for code in source.codes() {
            let Some(Ok(shape)) = source.shape(code) else {
                continue;
            };
            let Some(rect) = shape.bounding_rect() else {
                continue;
            };
            items.push(ZoneEnvelope {
                code,
                aabb: AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
            });
            shapes.insert(code, shape);
        }
        info!("Spatial index built for {} zones", items.len());
        ZoneLocator {
            tree: RTree::bulk_load(items),
            shapes,
        }
    }

    pub fn locate(&self, lon: f64, lat: f64) -> Option<ZoneCode> {
        let point = Point::new(lon, lat);
        let envelope = AABB::from_point([lon, lat]);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|candidate| candidate.code)
            .filter(|code| self.shapes.get(code).is_some_and(|s| s.contains(&point)))
            .min()
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}
