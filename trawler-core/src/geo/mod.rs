//! Geospatial primitives: cartesian unit vectors, query shapes and the
//! hierarchical triangular mesh (HTM) covering the unit sphere.
//!
//! Trixel ids are bit-packed so that a parent's id is the child's id
//! shifted right by two; a trixel's depth is recovered from the position
//! of its leading bit.

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

pub const HTM_MAX_LEVEL: u32 = 25;
/// Bit offset of a level-0 trixel id once normalised to full depth.
pub const HTM_START_POS: u32 = HTM_MAX_LEVEL * 2;

const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Fraction of a shape's angular radius a boundary trixel may span; picks
/// the subdivision level for area shapes.
const HTM_ERROR: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cartesian {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Cartesian {
    pub fn new(x: f64, y: f64, z: f64) -> Cartesian {
        Cartesian { x, y, z }
    }

    /// Unit vector for a latitude/longitude pair in degrees.
    pub fn from_degrees(latitude: f64, longitude: f64) -> Cartesian {
        let lat = latitude.to_radians();
        let lon = longitude.to_radians();
        Cartesian {
            x: lat.cos() * lon.cos(),
            y: lat.cos() * lon.sin(),
            z: lat.sin(),
        }
    }

    pub fn dot(&self, other: &Cartesian) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(&self, other: &Cartesian) -> Cartesian {
        Cartesian {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    pub fn normalized(&self) -> Cartesian {
        let n = self.norm();
        if n == 0.0 {
            return *self;
        }
        Cartesian {
            x: self.x / n,
            y: self.y / n,
            z: self.z / n,
        }
    }

    /// Angle in radians between two unit vectors.
    pub fn angle_to(&self, other: &Cartesian) -> f64 {
        self.dot(other).clamp(-1.0, 1.0).acos()
    }

    fn midpoint(&self, other: &Cartesian) -> Cartesian {
        Cartesian {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
        }
        .normalized()
    }
}

/// A half-space on the sphere: `dot(v, normal) >= min_dot`.
#[derive(Debug, Clone, Copy)]
pub struct Constraint {
    pub normal: Cartesian,
    pub min_dot: f64,
}

impl Constraint {
    fn contains(&self, v: &Cartesian) -> bool {
        self.normal.dot(v) >= self.min_dot
    }
}

#[derive(Debug, Clone)]
pub enum Shape {
    Point(Cartesian),
    Circle { center: Cartesian, radius: f64 },
    Convex { constraints: Vec<Constraint>, vertices: Vec<Cartesian> },
    Multi(Vec<Shape>),
}

impl Shape {
    pub fn point(latitude: f64, longitude: f64) -> Shape {
        Shape::Point(Cartesian::from_degrees(latitude, longitude))
    }

    /// Circle with a radius in meters over the reference sphere.
    pub fn circle(latitude: f64, longitude: f64, radius_meters: f64) -> Shape {
        Shape::Circle {
            center: Cartesian::from_degrees(latitude, longitude),
            radius: radius_meters / EARTH_RADIUS_METERS,
        }
    }

    /// Convex polygon from vertex coordinates in degrees. Edge orientation
    /// is fixed up so the centroid lies inside every half-space.
    pub fn polygon(coords: &[(f64, f64)]) -> Result<Shape> {
        if coords.len() < 3 {
            return Err(Error::Serialisation(
                "polygon requires at least three vertices".into(),
            ));
        }
        let vertices: Vec<Cartesian> = coords
            .iter()
            .map(|(lat, lon)| Cartesian::from_degrees(*lat, *lon))
            .collect();
        let mut centroid = Cartesian::new(0.0, 0.0, 0.0);
        for v in &vertices {
            centroid.x += v.x;
            centroid.y += v.y;
            centroid.z += v.z;
        }
        let centroid = centroid.normalized();

        let mut constraints = Vec::with_capacity(vertices.len());
        for i in 0..vertices.len() {
            let a = &vertices[i];
            let b = &vertices[(i + 1) % vertices.len()];
            let mut normal = a.cross(b).normalized();
            if normal.norm() == 0.0 {
                return Err(Error::Serialisation("degenerate polygon edge".into()));
            }
            if normal.dot(&centroid) < 0.0 {
                normal = Cartesian::new(-normal.x, -normal.y, -normal.z);
            }
            constraints.push(Constraint { normal, min_dot: 0.0 });
        }
        Ok(Shape::Convex { constraints, vertices })
    }

    pub fn centroids(&self) -> Vec<Cartesian> {
        match self {
            Shape::Point(p) => vec![*p],
            Shape::Circle { center, .. } => vec![*center],
            Shape::Convex { vertices, .. } => {
                let mut c = Cartesian::new(0.0, 0.0, 0.0);
                for v in vertices {
                    c.x += v.x;
                    c.y += v.y;
                    c.z += v.z;
                }
                vec![c.normalized()]
            }
            Shape::Multi(shapes) => shapes.iter().flat_map(|s| s.centroids()).collect(),
        }
    }

    fn contains(&self, v: &Cartesian) -> bool {
        match self {
            // A bare point behaves as a tiny cap so lookups do not depend
            // on exact floating point equality.
            Shape::Point(p) => p.angle_to(v) <= 1e-8,
            Shape::Circle { center, radius } => center.angle_to(v) <= *radius,
            Shape::Convex { constraints, .. } => constraints.iter().all(|c| c.contains(v)),
            Shape::Multi(shapes) => shapes.iter().any(|s| s.contains(v)),
        }
    }

    /// Maximal aligned trixel ids covering this shape.
    pub fn trixels(&self, partials: bool, max_level: u32) -> Vec<u64> {
        match self {
            Shape::Multi(shapes) => {
                let mut out: Vec<u64> = shapes
                    .iter()
                    .flat_map(|s| s.trixels(partials, max_level))
                    .collect();
                out.sort_unstable();
                out.dedup();
                out
            }
            Shape::Point(p) => vec![htm_lookup(p, max_level)],
            _ => {
                let mut out = Vec::new();
                for root in htm_roots() {
                    cover(self, &root, partials, max_level, &mut out);
                }
                out
            }
        }
    }

    /// Sorted, merged full-depth id ranges covering this shape.
    pub fn trixel_ranges(&self, partials: bool, max_level: u32) -> Vec<TrixelRange> {
        let trixels = self.trixels(partials, max_level);
        let mut ranges: Vec<TrixelRange> = trixels.iter().map(|id| trixel_range(*id)).collect();
        merge_ranges(&mut ranges);
        ranges
    }

    /// Ranges at the shape's own resolution; boundary trixels stay small
    /// relative to the shape.
    pub fn trixel_ranges_auto(&self, partials: bool) -> Vec<TrixelRange> {
        match self {
            Shape::Multi(shapes) => {
                let mut ranges: Vec<TrixelRange> = shapes
                    .iter()
                    .flat_map(|s| s.trixel_ranges_auto(partials))
                    .collect();
                merge_ranges(&mut ranges);
                ranges
            }
            _ => self.trixel_ranges(partials, self.resolution()),
        }
    }

    /// Angular radius in radians; zero for points.
    fn angular_radius(&self) -> f64 {
        match self {
            Shape::Point(_) => 0.0,
            Shape::Circle { radius, .. } => *radius,
            Shape::Convex { vertices, .. } => {
                let centroid = self.centroids()[0];
                vertices
                    .iter()
                    .map(|v| centroid.angle_to(v))
                    .fold(0.0, f64::max)
            }
            Shape::Multi(shapes) => shapes
                .iter()
                .map(Shape::angular_radius)
                .fold(0.0, f64::max),
        }
    }

    /// Subdivision level where boundary trixels shrink below the error
    /// fraction of the shape's radius. Points resolve to full depth.
    pub fn resolution(&self) -> u32 {
        let radius = self.angular_radius();
        if radius <= 0.0 {
            return HTM_MAX_LEVEL;
        }
        let target = radius * HTM_ERROR;
        let mut level = 0;
        let mut size = std::f64::consts::FRAC_PI_2;
        while size > target && level < HTM_MAX_LEVEL {
            size /= 2.0;
            level += 1;
        }
        level
    }
}

/// Full-depth id interval of one or more adjacent trixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrixelRange {
    pub start: u64,
    pub end: u64,
}

impl TrixelRange {
    pub fn intersects(&self, other: &TrixelRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

pub fn merge_ranges(ranges: &mut Vec<TrixelRange>) {
    ranges.sort_unstable();
    let mut merged: Vec<TrixelRange> = Vec::with_capacity(ranges.len());
    for r in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if r.start <= last.end.saturating_add(1) => {
                if r.end > last.end {
                    last.end = r.end;
                }
            }
            _ => merged.push(r),
        }
    }
    *ranges = merged;
}

/// Depth of a bit-packed trixel id, recovered from its leading bit.
pub fn trixel_depth(id: u64) -> u32 {
    let bits = 64 - id.leading_zeros();
    (bits - 4) / 2
}

/// Full-depth id interval covered by a trixel id of any depth.
pub fn trixel_range(id: u64) -> TrixelRange {
    let shift = HTM_START_POS - trixel_depth(id) * 2;
    TrixelRange {
        start: id << shift,
        end: ((id + 1) << shift) - 1,
    }
}

/// Decomposes merged full-depth ranges back into maximal aligned trixel
/// ids, the inverse of [`trixel_range`].
pub fn id_trixels(ranges: &[TrixelRange]) -> Vec<u64> {
    let mut out = Vec::new();
    for range in ranges {
        let mut start = range.start;
        while start <= range.end {
            let mut shift = (start.trailing_zeros() & !1).min(HTM_START_POS);
            while shift > 0 && start + ((1u64 << shift) - 1) > range.end {
                shift -= 2;
            }
            out.push(start >> shift);
            match start.checked_add(1u64 << shift) {
                Some(next) => start = next,
                None => break,
            }
        }
    }
    out
}

struct Trixel {
    id: u64,
    v0: Cartesian,
    v1: Cartesian,
    v2: Cartesian,
}

fn htm_roots() -> Vec<Trixel> {
    let v0 = Cartesian::new(0.0, 0.0, 1.0);
    let v1 = Cartesian::new(1.0, 0.0, 0.0);
    let v2 = Cartesian::new(0.0, 1.0, 0.0);
    let v3 = Cartesian::new(-1.0, 0.0, 0.0);
    let v4 = Cartesian::new(0.0, -1.0, 0.0);
    let v5 = Cartesian::new(0.0, 0.0, -1.0);
    vec![
        Trixel { id: 8, v0: v1, v1: v5, v2 },
        Trixel { id: 9, v0: v2, v1: v5, v2: v3 },
        Trixel { id: 10, v0: v3, v1: v5, v2: v4 },
        Trixel { id: 11, v0: v4, v1: v5, v2: v1 },
        Trixel { id: 12, v0: v1, v1: v0, v2: v4 },
        Trixel { id: 13, v0: v4, v1: v0, v2: v3 },
        Trixel { id: 14, v0: v3, v1: v0, v2 },
        Trixel { id: 15, v0: v2, v1: v0, v2: v1 },
    ]
}

fn children(t: &Trixel) -> [Trixel; 4] {
    let w0 = t.v1.midpoint(&t.v2);
    let w1 = t.v0.midpoint(&t.v2);
    let w2 = t.v0.midpoint(&t.v1);
    [
        Trixel { id: t.id << 2, v0: t.v0, v1: w2, v2: w1 },
        Trixel { id: (t.id << 2) | 1, v0: t.v1, v1: w0, v2: w2 },
        Trixel { id: (t.id << 2) | 2, v0: t.v2, v1: w1, v2: w0 },
        Trixel { id: (t.id << 2) | 3, v0: w0, v1: w1, v2: w2 },
    ]
}

fn trixel_contains(t: &Trixel, v: &Cartesian) -> bool {
    t.v0.cross(&t.v1).dot(v) >= -1e-12
        && t.v1.cross(&t.v2).dot(v) >= -1e-12
        && t.v2.cross(&t.v0).dot(v) >= -1e-12
}

#[derive(PartialEq)]
enum Verdict {
    Full,
    Partial,
    Outside,
}

fn classify(shape: &Shape, t: &Trixel) -> Verdict {
    let corners = [&t.v0, &t.v1, &t.v2];
    let inside = corners.iter().filter(|c| shape.contains(c)).count();
    if inside == 3 {
        return Verdict::Full;
    }
    if inside > 0 {
        return Verdict::Partial;
    }
    // No corner inside: the shape may still poke into the trixel.
    let pokes = match shape {
        Shape::Point(p) => trixel_contains(t, p),
        Shape::Circle { center, .. } => trixel_contains(t, center),
        Shape::Convex { vertices, .. } => vertices.iter().any(|v| trixel_contains(t, v)),
        Shape::Multi(shapes) => {
            return if shapes.iter().any(|s| classify(s, t) != Verdict::Outside) {
                Verdict::Partial
            } else {
                Verdict::Outside
            };
        }
    };
    if pokes {
        Verdict::Partial
    } else {
        Verdict::Outside
    }
}

fn cover(shape: &Shape, t: &Trixel, partials: bool, max_level: u32, out: &mut Vec<u64>) {
    match classify(shape, t) {
        Verdict::Outside => {}
        Verdict::Full => out.push(t.id),
        Verdict::Partial => {
            if trixel_depth(t.id) >= max_level {
                if partials {
                    out.push(t.id);
                }
            } else {
                for child in children(t) {
                    cover(shape, &child, partials, max_level, out);
                }
            }
        }
    }
}

/// Full-depth trixel id containing a unit vector.
pub fn htm_lookup(v: &Cartesian, max_level: u32) -> u64 {
    let mut current = htm_roots()
        .into_iter()
        .find(|t| trixel_contains(t, v))
        .expect("unit vector must fall inside a root trixel");
    for _ in 0..max_level {
        let kids = children(&current);
        let mut next = None;
        for kid in kids {
            if trixel_contains(&kid, v) {
                next = Some(kid);
                break;
            }
        }
        current = next.expect("unit vector must fall inside a child trixel");
    }
    current.id
}

/// Serialises trixel ranges and centroids into a slot value.
pub fn serialise_ranges(ranges: &[TrixelRange], centroids: &[Cartesian]) -> Vec<u8> {
    let mut range_bytes = Vec::with_capacity(ranges.len() * 16);
    for r in ranges {
        range_bytes.extend_from_slice(&r.start.to_be_bytes());
        range_bytes.extend_from_slice(&r.end.to_be_bytes());
    }
    let mut centroid_bytes = Vec::with_capacity(centroids.len() * 24);
    for c in centroids {
        centroid_bytes.extend_from_slice(&c.x.to_be_bytes());
        centroid_bytes.extend_from_slice(&c.y.to_be_bytes());
        centroid_bytes.extend_from_slice(&c.z.to_be_bytes());
    }
    crate::serialise::serialise_strings([&range_bytes, &centroid_bytes])
}

pub fn unserialise_ranges(bytes: &[u8]) -> Result<(Vec<TrixelRange>, Vec<Cartesian>)> {
    let parts = crate::serialise::unserialise_strings(bytes)?;
    if parts.len() != 2 {
        return Err(Error::Serialisation("bad geo slot value".into()));
    }
    let mut ranges = Vec::with_capacity(parts[0].len() / 16);
    for chunk in parts[0].chunks_exact(16) {
        ranges.push(TrixelRange {
            start: u64::from_be_bytes(chunk[..8].try_into().unwrap()),
            end: u64::from_be_bytes(chunk[8..].try_into().unwrap()),
        });
    }
    let mut centroids = Vec::with_capacity(parts[1].len() / 24);
    for chunk in parts[1].chunks_exact(24) {
        centroids.push(Cartesian {
            x: f64::from_be_bytes(chunk[..8].try_into().unwrap()),
            y: f64::from_be_bytes(chunk[8..16].try_into().unwrap()),
            z: f64::from_be_bytes(chunk[16..].try_into().unwrap()),
        });
    }
    Ok((ranges, centroids))
}

/// Parses the JSON geo shapes accepted by the query DSL and the indexer:
/// `_point`, `_circle`, `_polygon`, `_chull` and `_geo_intersection`.
pub fn shape_from_json(value: &serde_json::Value) -> Result<Shape> {
    let map = value
        .as_object()
        .ok_or_else(|| Error::Serialisation(format!("invalid geo shape: {value}")))?;

    let mut shapes = Vec::new();
    for (key, body) in map {
        let shape = match key.as_str() {
            "_point" => {
                let (lat, lon) = lat_lon(body)?;
                Shape::point(lat, lon)
            }
            "_circle" => {
                let (lat, lon) = lat_lon(body)?;
                let radius = body
                    .get("_radius")
                    .and_then(serde_json::Value::as_f64)
                    .ok_or_else(|| Error::Serialisation("circle requires _radius".into()))?;
                Shape::circle(lat, lon, radius)
            }
            "_polygon" | "_chull" => {
                let lats = coord_list(body, "_latitude")?;
                let lons = coord_list(body, "_longitude")?;
                if lats.len() != lons.len() {
                    return Err(Error::Serialisation(
                        "polygon latitude/longitude length mismatch".into(),
                    ));
                }
                let coords: Vec<(f64, f64)> = lats.into_iter().zip(lons).collect();
                Shape::polygon(&coords)?
            }
            "_geo_intersection" => shape_from_json(body)?,
            other => {
                return Err(Error::Serialisation(format!("invalid geo shape: {other}")));
            }
        };
        shapes.push(shape);
    }

    match shapes.len() {
        0 => Err(Error::Serialisation("empty geo shape".into())),
        1 => Ok(shapes.pop().unwrap()),
        _ => Ok(Shape::Multi(shapes)),
    }
}

fn lat_lon(body: &serde_json::Value) -> Result<(f64, f64)> {
    let lat = body
        .get("_latitude")
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| Error::Serialisation("missing _latitude".into()))?;
    let lon = body
        .get("_longitude")
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| Error::Serialisation("missing _longitude".into()))?;
    Ok((lat, lon))
}

fn coord_list(body: &serde_json::Value, key: &str) -> Result<Vec<f64>> {
    body.get(key)
        .and_then(serde_json::Value::as_array)
        .map(|items| items.iter().filter_map(serde_json::Value::as_f64).collect())
        .ok_or_else(|| Error::Serialisation(format!("missing {key} list")))
}
