//! CHS geometry tables and the LBA mapping used by the legacy disk
//! services.

/// Translation geometry: `lba == (c * heads + h) * sectors + (s - 1)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChsGeometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
}

impl ChsGeometry {
    pub fn lba(&self, cylinder: u32, head: u32, sector: u32) -> Option<u64> {
        if sector == 0 || sector > self.sectors || head >= self.heads || cylinder >= self.cylinders
        {
            return None;
        }
        Some(((cylinder * self.heads + head) * self.sectors + sector - 1) as u64)
    }

    pub fn total_sectors(&self) -> u64 {
        self.cylinders as u64 * self.heads as u64 * self.sectors as u64
    }
}

/// Classic floppy formats by total size in bytes.
pub fn floppy_geometry(size_bytes: u64) -> ChsGeometry {
    match size_bytes {
        0..=368_640 => ChsGeometry {
            cylinders: 40,
            heads: 2,
            sectors: 9,
        },
        368_641..=737_280 => ChsGeometry {
            cylinders: 80,
            heads: 2,
            sectors: 9,
        },
        737_281..=1_228_800 => ChsGeometry {
            cylinders: 80,
            heads: 2,
            sectors: 15,
        },
        1_228_801..=1_474_560 => ChsGeometry {
            cylinders: 80,
            heads: 2,
            sectors: 18,
        },
        _ => ChsGeometry {
            cylinders: 80,
            heads: 2,
            sectors: 36,
        },
    }
}

/// Fixed-disk translation: 16 heads × 63 sectors, cylinders from the
/// image size, clamped to the interface maximum.
pub fn hdd_geometry(total_sectors: u64) -> ChsGeometry {
    let cylinders = (total_sectors / (16 * 63)).clamp(1, 1024) as u32;
    ChsGeometry {
        cylinders,
        heads: 16,
        sectors: 63,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chs_to_lba_identity() {
        let g = hdd_geometry(1024 * 16 * 63);
        for (c, h, s, expected) in [
            (0, 0, 1, 0u64),
            (0, 0, 63, 62),
            (0, 1, 1, 63),
            (1, 0, 1, 16 * 63),
            (2, 5, 7, (2 * 16 + 5) * 63 + 6),
        ] {
            assert_eq!(g.lba(c, h, s), Some(expected));
        }
    }

    #[test]
    fn invalid_chs_is_rejected() {
        let g = hdd_geometry(1024 * 16 * 63);
        assert_eq!(g.lba(0, 0, 0), None); // sectors are 1-based
        assert_eq!(g.lba(0, 16, 1), None);
        assert_eq!(g.lba(0, 0, 64), None);
        assert_eq!(g.lba(1024, 0, 1), None);
    }

    #[test]
    fn floppy_table_matches_the_classic_formats() {
        let g144 = floppy_geometry(1_474_560);
        assert_eq!(g144, ChsGeometry { cylinders: 80, heads: 2, sectors: 18 });
        let g288 = floppy_geometry(2_949_120);
        assert_eq!(g288.sectors, 36);
        let g12 = floppy_geometry(1_228_800);
        assert_eq!(g12.sectors, 15);
    }
}
