//! Core ID types for the map structures.

/// Unique identifier for a keyframe within a map.
///
/// Assigned sequentially at insertion. IDs are lightweight handles for
/// cross-referencing without Arc/Rc, which keeps ownership simple and
/// avoids cyclic references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyframeId(pub u64);

impl KeyframeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyframeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a map point within a map.
///
/// A map point is a 3D landmark observed by one or more keyframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapPointId(pub u64);

impl MapPointId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_equality() {
        assert_eq!(KeyframeId::new(42), KeyframeId::new(42));
        assert_ne!(KeyframeId::new(42), KeyframeId::new(43));
    }

    #[test]
    fn test_id_display() {
        assert_eq!(format!("{}", KeyframeId::new(7)), "KF7");
        assert_eq!(format!("{}", MapPointId::new(123)), "MP123");
    }

    #[test]
    fn test_id_as_hashmap_key() {
        use std::collections::HashMap;

        let mut map: HashMap<MapPointId, &str> = HashMap::new();
        map.insert(MapPointId::new(1), "first");

        assert_eq!(map.get(&MapPointId::new(1)), Some(&"first"));
        assert_eq!(map.get(&MapPointId::new(2)), None);
    }
}
