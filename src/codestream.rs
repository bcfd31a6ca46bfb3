//! Codestream geometry oracle
//!
//! The engine never parses codestreams itself. Everything it needs to know about
//! tiles, resolutions and precincts comes through [`CodestreamIndex`], built from
//! the main header by a [`HeaderParser`].
//!
//! [`RegularCodestream`] is a self-contained geometry for images with a regular
//! tile grid and one power-of-two precinct partition shared by every
//! resolution level. Its "main header" is a JSON description, which is what the
//! loopback server hands out.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{div_ceil, Rect, Size};
use crate::window::RoundDirection;

/// Decomposition of an in-class identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrecinctAddress {
    /// In-class identifier
    pub id: u64,
    pub tile: u32,
    pub component: u32,
    /// Resolution level, 0 being the coarsest
    pub resolution: u32,
    /// Precinct index inside its tile-component-resolution, raster order
    pub precinct: u64,
}

/// A precinct together with its footprint in a particular frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecinctInfo {
    pub address: PrecinctAddress,
    /// Spatial bounds in the coordinates of the queried frame
    pub bounds: Rect,
}

/// Geometry queries the client engine relies on
pub trait CodestreamIndex: Send + Sync {
    /// Full-resolution image size
    fn image_size(&self) -> Size;

    fn num_components(&self) -> u32;

    /// Number of quality layers in the codestream
    fn num_layers(&self) -> u32;

    /// Largest number of resolution levels that may be discarded
    fn max_discard_levels(&self) -> u32;

    /// Frame size obtained after discarding `discard_levels` resolution levels
    fn frame_size(&self, discard_levels: u32) -> Size;

    /// Precincts of `components` needed to render `region` of the frame at
    /// `discard_levels`, lower resolution levels included
    fn precincts(&self, discard_levels: u32, region: &Rect, components: &[u32]) -> Vec<PrecinctInfo>;

    /// Decomposes an in-class identifier
    fn locate(&self, id: u64) -> Option<PrecinctAddress>;

    /// Bounds of a precinct in the frame at `discard_levels`, `None` if the
    /// precinct does not contribute to that frame
    fn precinct_bounds(&self, address: &PrecinctAddress, discard_levels: u32) -> Option<Rect>;

    /// Compression ratio targeted by each quality layer, empty if unknown
    fn layer_compression_ratios(&self) -> Vec<f64> {
        Vec::new()
    }

    /// Components that must be fetched to reconstruct `components`
    fn relevant_components(&self, components: &[u32]) -> Vec<u32> {
        components.to_vec()
    }

    /// Number of discard levels whose frame best matches `frame` under `round`
    fn discard_levels(&self, frame: Size, round: RoundDirection) -> u32 {
        let max = self.max_discard_levels();
        match round {
            RoundDirection::Down => (0..=max)
                .find(|&r| self.frame_size(r).fits_in(frame))
                .unwrap_or(max),
            RoundDirection::Up => (0..=max)
                .rev()
                .find(|&r| frame.fits_in(self.frame_size(r)))
                .unwrap_or(0),
            RoundDirection::Closest => (0..=max)
                .min_by_key(|&r| {
                    let area = self.frame_size(r).pixel_count() as i128;
                    (area - frame.pixel_count() as i128).abs()
                })
                .unwrap_or(0),
        }
    }

    /// Discard levels at which a precinct is shown at its native resolution
    fn native_discard_levels(&self, address: &PrecinctAddress) -> u32 {
        self.max_discard_levels().saturating_sub(address.resolution)
    }
}

/// Builds a geometry oracle from main header bytes
pub trait HeaderParser: Send + Sync {
    fn parse(&self, main_header: &[u8]) -> Result<Arc<dyn CodestreamIndex>>;
}

/// Regular tiled geometry with a single precinct partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegularCodestream {
    pub width: u64,
    pub height: u64,
    pub tile_width: u64,
    pub tile_height: u64,
    pub components: u32,
    pub number_of_layers: u32,
    pub decomposition_levels: u32,
    /// Precinct width as a power of two, in resolution-level coordinates
    pub precinct_width_exp: u32,
    pub precinct_height_exp: u32,
    /// Per-layer compression ratios, first layer most compressed
    #[serde(default)]
    pub layer_ratios: Vec<f64>,
    /// Components 0..3 are coupled by a multi-component transform
    #[serde(default)]
    pub mct: bool,
}

/// Precinct partition of one tile at one resolution level
struct PrecinctGrid {
    rect: Rect,
    first_x: u64,
    first_y: u64,
    wide: u64,
    high: u64,
    cell_width: u64,
    cell_height: u64,
}

impl PrecinctGrid {
    fn count(&self) -> u64 {
        self.wide * self.high
    }

    /// Bounds of precinct `p` in resolution-level coordinates
    fn cell(&self, p: u64) -> Option<Rect> {
        if p >= self.count() {
            return None;
        }
        let cx = self.first_x + p % self.wide;
        let cy = self.first_y + p / self.wide;
        let cell = Rect::new(
            cx * self.cell_width,
            cy * self.cell_height,
            self.cell_width,
            self.cell_height,
        );
        cell.intersection(&self.rect)
    }
}

impl RegularCodestream {
    /// Single tile, one component, 8 layers, 5 decomposition levels, 64x64 precincts
    pub fn new(width: u64, height: u64) -> Self {
        Self {
            width,
            height,
            tile_width: width,
            tile_height: height,
            components: 1,
            number_of_layers: 8,
            decomposition_levels: 5,
            precinct_width_exp: 6,
            precinct_height_exp: 6,
            layer_ratios: Vec::new(),
            mct: false,
        }
    }

    pub fn with_tiles(mut self, tile_width: u64, tile_height: u64) -> Self {
        self.tile_width = tile_width;
        self.tile_height = tile_height;
        self
    }

    pub fn with_components(mut self, components: u32) -> Self {
        self.components = components;
        self
    }

    pub fn with_layers(mut self, layers: u32) -> Self {
        self.number_of_layers = layers;
        self
    }

    pub fn with_levels(mut self, levels: u32) -> Self {
        self.decomposition_levels = levels;
        self
    }

    pub fn with_precinct_exp(mut self, width_exp: u32, height_exp: u32) -> Self {
        self.precinct_width_exp = width_exp;
        self.precinct_height_exp = height_exp;
        self
    }

    pub fn with_layer_ratios(mut self, ratios: Vec<f64>) -> Self {
        self.layer_ratios = ratios;
        self
    }

    pub fn with_mct(mut self, mct: bool) -> Self {
        self.mct = mct;
        self
    }

    /// Checks the description is usable
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Codestream("empty image".to_string()));
        }
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(Error::Codestream("empty tile size".to_string()));
        }
        if self.components == 0 || self.number_of_layers == 0 {
            return Err(Error::Codestream(
                "at least one component and one layer required".to_string(),
            ));
        }
        if self.decomposition_levels > 32 || self.precinct_width_exp > 15 || self.precinct_height_exp > 15 {
            return Err(Error::Codestream("geometry exponent out of range".to_string()));
        }
        Ok(())
    }

    /// Serialized description served as the main header
    pub fn main_header(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a description produced by [`RegularCodestream::main_header`]
    pub fn from_header(bytes: &[u8]) -> Result<Self> {
        let geometry: RegularCodestream = serde_json::from_slice(bytes)
            .map_err(|e| Error::Codestream(format!("unreadable main header: {}", e)))?;
        geometry.validate()?;
        Ok(geometry)
    }

    fn tiles_wide(&self) -> u64 {
        div_ceil(self.width, self.tile_width)
    }

    fn num_tiles(&self) -> u64 {
        self.tiles_wide() * div_ceil(self.height, self.tile_height)
    }

    /// Tile bounds at full resolution
    fn tile_rect(&self, tile: u64) -> Rect {
        let tx = tile % self.tiles_wide();
        let ty = tile / self.tiles_wide();
        let x0 = tx * self.tile_width;
        let y0 = ty * self.tile_height;
        Rect::from_corners(
            x0,
            y0,
            (x0 + self.tile_width).min(self.width),
            (y0 + self.tile_height).min(self.height),
        )
    }

    /// Tile bounds at resolution level `resolution`
    fn tile_rect_at(&self, tile: u64, resolution: u32) -> Rect {
        let factor = 1u64 << (self.decomposition_levels - resolution);
        let full = self.tile_rect(tile);
        Rect::from_corners(
            div_ceil(full.x, factor),
            div_ceil(full.y, factor),
            div_ceil(full.right(), factor),
            div_ceil(full.bottom(), factor),
        )
    }

    fn grid(&self, tile: u64, resolution: u32) -> PrecinctGrid {
        let rect = self.tile_rect_at(tile, resolution);
        let cell_width = 1u64 << self.precinct_width_exp;
        let cell_height = 1u64 << self.precinct_height_exp;
        let first_x = rect.x / cell_width;
        let first_y = rect.y / cell_height;
        let wide = if rect.width == 0 { 0 } else { div_ceil(rect.right(), cell_width) - first_x };
        let high = if rect.height == 0 { 0 } else { div_ceil(rect.bottom(), cell_height) - first_y };
        PrecinctGrid {
            rect,
            first_x,
            first_y,
            wide,
            high,
            cell_width,
            cell_height,
        }
    }

    /// Precinct sequence number of the first precinct at `resolution`
    fn sequence_base(&self, tile: u64, resolution: u32) -> u64 {
        (0..resolution).map(|r| self.grid(tile, r).count()).sum()
    }

    /// JPIP in-class identifier of a precinct data-bin
    pub fn in_class_id(&self, tile: u32, component: u32, resolution: u32, precinct: u64) -> u64 {
        let sequence = self.sequence_base(tile as u64, resolution) + precinct;
        tile as u64 + (component as u64 + sequence * self.components as u64) * self.num_tiles()
    }

    /// Maps resolution-level bounds into the frame at `discard_levels`
    fn to_frame(&self, cell: Rect, resolution: u32, discard_levels: u32) -> Option<Rect> {
        let factor = 1u64 << (self.decomposition_levels - discard_levels - resolution);
        let frame = Rect::from_size(self.frame_size(discard_levels));
        Rect::new(
            cell.x * factor,
            cell.y * factor,
            cell.width * factor,
            cell.height * factor,
        )
        .intersection(&frame)
    }
}

impl CodestreamIndex for RegularCodestream {
    fn image_size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    fn num_components(&self) -> u32 {
        self.components
    }

    fn num_layers(&self) -> u32 {
        self.number_of_layers
    }

    fn max_discard_levels(&self) -> u32 {
        self.decomposition_levels
    }

    fn frame_size(&self, discard_levels: u32) -> Size {
        let factor = 1u64 << discard_levels.min(self.decomposition_levels);
        Size::new(div_ceil(self.width, factor), div_ceil(self.height, factor))
    }

    fn precincts(&self, discard_levels: u32, region: &Rect, components: &[u32]) -> Vec<PrecinctInfo> {
        if discard_levels > self.decomposition_levels {
            return Vec::new();
        }
        let frame = Rect::from_size(self.frame_size(discard_levels));
        let region = match region.intersection(&frame) {
            Some(region) => region,
            None => return Vec::new(),
        };
        let top = self.decomposition_levels - discard_levels;
        let mut found = Vec::new();

        for tile in 0..self.num_tiles() {
            if !self.tile_rect_at(tile, top).intersects(&region) {
                continue;
            }
            for resolution in 0..=top {
                let grid = self.grid(tile, resolution);
                if grid.count() == 0 {
                    continue;
                }
                let factor = 1u64 << (top - resolution);
                let rx0 = region.x / factor;
                let ry0 = region.y / factor;
                let rx1 = div_ceil(region.right(), factor);
                let ry1 = div_ceil(region.bottom(), factor);

                let col0 = (rx0 / grid.cell_width).max(grid.first_x);
                let col1 = div_ceil(rx1, grid.cell_width).min(grid.first_x + grid.wide);
                let row0 = (ry0 / grid.cell_height).max(grid.first_y);
                let row1 = div_ceil(ry1, grid.cell_height).min(grid.first_y + grid.high);

                for row in row0..row1 {
                    for col in col0..col1 {
                        let p = (row - grid.first_y) * grid.wide + (col - grid.first_x);
                        let bounds = grid
                            .cell(p)
                            .and_then(|cell| self.to_frame(cell, resolution, discard_levels));
                        let bounds = match bounds {
                            Some(b) if b.intersects(&region) => b,
                            _ => continue,
                        };
                        for &component in components {
                            if component >= self.components {
                                continue;
                            }
                            let id = self.in_class_id(tile as u32, component, resolution, p);
                            found.push(PrecinctInfo {
                                address: PrecinctAddress {
                                    id,
                                    tile: tile as u32,
                                    component,
                                    resolution,
                                    precinct: p,
                                },
                                bounds,
                            });
                        }
                    }
                }
            }
        }

        found.sort_by_key(|info| info.address.id);
        found
    }

    fn locate(&self, id: u64) -> Option<PrecinctAddress> {
        let tiles = self.num_tiles();
        let tile = id % tiles;
        let rest = id / tiles;
        let component = (rest % self.components as u64) as u32;
        let mut sequence = rest / self.components as u64;

        for resolution in 0..=self.decomposition_levels {
            let count = self.grid(tile, resolution).count();
            if sequence < count {
                return Some(PrecinctAddress {
                    id,
                    tile: tile as u32,
                    component,
                    resolution,
                    precinct: sequence,
                });
            }
            sequence -= count;
        }
        None
    }

    fn precinct_bounds(&self, address: &PrecinctAddress, discard_levels: u32) -> Option<Rect> {
        if discard_levels > self.decomposition_levels
            || address.resolution > self.decomposition_levels - discard_levels
            || address.tile as u64 >= self.num_tiles()
        {
            return None;
        }
        let cell = self.grid(address.tile as u64, address.resolution).cell(address.precinct)?;
        self.to_frame(cell, address.resolution, discard_levels)
    }

    fn layer_compression_ratios(&self) -> Vec<f64> {
        self.layer_ratios.clone()
    }

    fn relevant_components(&self, components: &[u32]) -> Vec<u32> {
        let mut relevant = components.to_vec();
        if self.mct && self.components >= 3 && components.iter().any(|&c| c < 3) {
            relevant.extend([0, 1, 2]);
        }
        relevant.sort_unstable();
        relevant.dedup();
        relevant
    }
}

/// Parser for headers served by the loopback server
#[derive(Debug, Clone, Copy, Default)]
pub struct RegularHeaderParser;

impl HeaderParser for RegularHeaderParser {
    fn parse(&self, main_header: &[u8]) -> Result<Arc<dyn CodestreamIndex>> {
        Ok(Arc::new(RegularCodestream::from_header(main_header)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> RegularCodestream {
        // 1024x1024, levels 3, 256x256 precincts: resolutions hold 1, 1, 4, 16 precincts
        RegularCodestream::new(1024, 1024)
            .with_levels(3)
            .with_precinct_exp(8, 8)
            .with_layers(4)
    }

    #[test]
    fn test_frame_sizes() {
        let g = geometry();
        assert_eq!(g.frame_size(0), Size::new(1024, 1024));
        assert_eq!(g.frame_size(1), Size::new(512, 512));
        assert_eq!(g.frame_size(3), Size::new(128, 128));

        let odd = RegularCodestream::new(1001, 999).with_levels(2);
        assert_eq!(odd.frame_size(1), Size::new(501, 500));
    }

    #[test]
    fn test_discard_level_rounding() {
        let g = geometry();
        assert_eq!(g.discard_levels(Size::new(1024, 1024), RoundDirection::Down), 0);
        assert_eq!(g.discard_levels(Size::new(600, 600), RoundDirection::Down), 1);
        assert_eq!(g.discard_levels(Size::new(600, 600), RoundDirection::Up), 0);
        assert_eq!(g.discard_levels(Size::new(300, 300), RoundDirection::Closest), 2);
        assert_eq!(g.discard_levels(Size::new(10, 10), RoundDirection::Down), 3);
        assert_eq!(g.discard_levels(Size::new(4096, 4096), RoundDirection::Up), 0);
    }

    #[test]
    fn test_locate_round_trips_identifiers() {
        let g = geometry().with_components(3).with_tiles(512, 512);
        for id in 0..84 {
            let address = g.locate(id).unwrap();
            assert_eq!(
                g.in_class_id(address.tile, address.component, address.resolution, address.precinct),
                id
            );
        }
    }

    #[test]
    fn test_locate_out_of_range() {
        let g = geometry();
        // 1 + 1 + 4 + 16 precincts in a single tile, single component
        assert!(g.locate(21).is_some());
        assert!(g.locate(22).is_none());
    }

    #[test]
    fn test_precincts_for_full_frame() {
        let g = geometry();
        let all = g.precincts(0, &Rect::new(0, 0, 1024, 1024), &[0]);
        assert_eq!(all.len(), 22);

        let coarse = g.precincts(3, &Rect::new(0, 0, 128, 128), &[0]);
        assert_eq!(coarse.len(), 1);
        assert_eq!(coarse[0].address.resolution, 0);
        assert_eq!(coarse[0].bounds, Rect::new(0, 0, 128, 128));
    }

    #[test]
    fn test_precincts_for_corner_region() {
        let g = geometry();
        let corner = g.precincts(0, &Rect::new(0, 0, 256, 256), &[0]);
        // one precinct per resolution level covers the corner
        assert_eq!(corner.len(), 4);
        let finest = corner.iter().find(|p| p.address.resolution == 3).unwrap();
        assert_eq!(finest.bounds, Rect::new(0, 0, 256, 256));
    }

    #[test]
    fn test_precinct_bounds_scale_with_frame() {
        let g = geometry();
        let address = g.locate(g.in_class_id(0, 0, 2, 3)).unwrap();
        assert_eq!(g.precinct_bounds(&address, 1), Some(Rect::new(256, 256, 256, 256)));
        assert_eq!(g.precinct_bounds(&address, 0), Some(Rect::new(512, 512, 512, 512)));
        assert_eq!(g.precinct_bounds(&address, 2), None);
    }

    #[test]
    fn test_relevant_components_with_mct() {
        let g = geometry().with_components(4).with_mct(true);
        assert_eq!(g.relevant_components(&[1]), vec![0, 1, 2]);
        assert_eq!(g.relevant_components(&[3]), vec![3]);
        let plain = geometry().with_components(4);
        assert_eq!(plain.relevant_components(&[1]), vec![1]);
    }

    #[test]
    fn test_header_round_trip() {
        let g = geometry().with_layer_ratios(vec![64.0, 16.0, 4.0, 1.0]);
        let parsed = RegularCodestream::from_header(&g.main_header().unwrap()).unwrap();
        assert_eq!(parsed, g);
        assert!(RegularCodestream::from_header(b"not json").is_err());
    }

    #[test]
    fn test_parser_rejects_invalid_geometry() {
        let bad = RegularCodestream::new(0, 10);
        let header = serde_json::to_vec(&bad).unwrap();
        assert!(RegularHeaderParser.parse(&header).is_err());
    }
}
