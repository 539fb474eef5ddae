//! Biome categories.
//!
//! The generator classifies terrain with sparse bit-flag identifiers
//! (1, 2, 4, ... 512, with 128 unused) rather than a dense index. Any value
//! outside that set maps to [`Biome::Unclassified`] instead of failing.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name used for identifiers outside the known bit-flag set.
pub const UNCLASSIFIED: &str = "Unclassified";

/// A terrain classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Biome {
    Meadows,
    Swamp,
    Mountain,
    BlackForest,
    Plains,
    Ocean,
    Mistlands,
    DeepNorth,
    Ashlands,
    /// Identifier outside the known set; the raw value is kept.
    Unclassified(u32),
}

impl Biome {
    /// Every known category, in bit-flag order.
    pub const KNOWN: [Biome; 9] = [
        Biome::Meadows,
        Biome::Swamp,
        Biome::Mountain,
        Biome::BlackForest,
        Biome::Plains,
        Biome::Ocean,
        Biome::Mistlands,
        Biome::DeepNorth,
        Biome::Ashlands,
    ];

    pub fn from_id(id: u32) -> Self {
        match id {
            1 => Biome::Meadows,
            2 => Biome::Swamp,
            4 => Biome::Mountain,
            8 => Biome::BlackForest,
            16 => Biome::Plains,
            32 => Biome::Ocean,
            64 => Biome::Mistlands,
            256 => Biome::DeepNorth,
            512 => Biome::Ashlands,
            other => Biome::Unclassified(other),
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Biome::Meadows => 1,
            Biome::Swamp => 2,
            Biome::Mountain => 4,
            Biome::BlackForest => 8,
            Biome::Plains => 16,
            Biome::Ocean => 32,
            Biome::Mistlands => 64,
            Biome::DeepNorth => 256,
            Biome::Ashlands => 512,
            Biome::Unclassified(raw) => *raw,
        }
    }

    /// Category name used in distributions and reports.
    ///
    /// All unknown identifiers share the single `Unclassified` category.
    pub fn name(&self) -> &'static str {
        match self {
            Biome::Meadows => "Meadows",
            Biome::Swamp => "Swamp",
            Biome::Mountain => "Mountain",
            Biome::BlackForest => "BlackForest",
            Biome::Plains => "Plains",
            Biome::Ocean => "Ocean",
            Biome::Mistlands => "Mistlands",
            Biome::DeepNorth => "DeepNorth",
            Biome::Ashlands => "Ashlands",
            Biome::Unclassified(_) => UNCLASSIFIED,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Biome::Unclassified(_))
    }

    /// Map colour (RGB).
    pub fn color(&self) -> [u8; 3] {
        match self {
            Biome::Meadows => [121, 176, 81],
            Biome::Swamp => [98, 89, 71],
            Biome::Mountain => [209, 228, 237],
            Biome::BlackForest => [45, 66, 40],
            Biome::Plains => [246, 222, 145],
            Biome::Ocean => [52, 97, 141],
            Biome::Mistlands => [105, 105, 120],
            Biome::DeepNorth => [240, 248, 255],
            Biome::Ashlands => [120, 70, 50],
            Biome::Unclassified(_) => [128, 128, 128],
        }
    }
}

impl fmt::Display for Biome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_ids_roundtrip() {
        for biome in Biome::KNOWN {
            assert_eq!(Biome::from_id(biome.id()), biome);
            assert!(biome.is_known());
        }
    }

    #[test]
    fn test_128_is_unclassified() {
        let biome = Biome::from_id(128);
        assert_eq!(biome, Biome::Unclassified(128));
        assert_eq!(biome.name(), UNCLASSIFIED);
        assert_eq!(biome.id(), 128);
    }

    #[test]
    fn test_unknown_ids_share_one_category_name() {
        assert_eq!(Biome::from_id(0).name(), Biome::from_id(3).name());
        assert!(!Biome::from_id(1024).is_known());
    }
}
