//! View windows: what a caller asks for and what it resolves to

use serde::{Deserialize, Serialize};

use crate::codestream::{CodestreamIndex, PrecinctInfo};
use crate::error::{Error, Result};
use crate::types::{div_ceil, Point, Rect, Size};

/// How a requested frame size is mapped onto an available resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundDirection {
    /// Largest available frame not exceeding the request
    #[default]
    Down,
    /// Smallest available frame covering the request
    Up,
    /// Available frame with the closest area
    Closest,
}

/// Inclusive range of image components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentRange {
    pub first: u32,
    pub last: u32,
}

impl ComponentRange {
    pub fn new(first: u32, last: u32) -> Self {
        Self { first, last }
    }

    pub fn single(component: u32) -> Self {
        Self::new(component, component)
    }

    pub fn contains(&self, component: u32) -> bool {
        self.first <= component && component <= self.last
    }

    /// Collapses a sorted component list into consecutive ranges
    pub fn compress(components: &[u32]) -> Vec<ComponentRange> {
        let mut ranges: Vec<ComponentRange> = Vec::new();
        for &c in components {
            match ranges.last_mut() {
                Some(range) if range.last + 1 == c => range.last = c,
                Some(range) if range.contains(c) => {}
                _ => ranges.push(ComponentRange::single(c)),
            }
        }
        ranges
    }
}

/// A rectangular, resolution- and quality-limited request on an image
///
/// A window without region offset and size asks for headers and metadata only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ViewWindow {
    pub frame_size: Option<Size>,
    pub region_offset: Option<Point>,
    pub region_size: Option<Size>,
    /// Empty means every component
    pub components: Vec<ComponentRange>,
    /// Quality layers, `None` means all of them
    pub layers: Option<u32>,
    pub round: RoundDirection,
}

impl ViewWindow {
    /// Header-only window
    pub fn new() -> Self {
        Self::default()
    }

    /// Window on `size` pixels at `offset` of a frame of `frame` pixels
    pub fn region(frame: Size, offset: Point, size: Size) -> Self {
        Self {
            frame_size: Some(frame),
            region_offset: Some(offset),
            region_size: Some(size),
            ..Self::default()
        }
    }

    pub fn with_components(mut self, components: Vec<ComponentRange>) -> Self {
        self.components = components;
        self
    }

    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = Some(layers);
        self
    }

    pub fn with_round(mut self, round: RoundDirection) -> Self {
        self.round = round;
        self
    }

    /// Back to a header-only request
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn has_region(&self) -> bool {
        self.region_offset.is_some() || self.region_size.is_some()
    }

    /// Region rectangle in the window's own frame, if any
    pub fn region_rect(&self) -> Option<Rect> {
        if !self.has_region() {
            return None;
        }
        let offset = self.region_offset.unwrap_or_default();
        let size = self.region_size.unwrap_or_default();
        Some(Rect::new(offset.x, offset.y, size.width, size.height))
    }

    /// Overrides the fields a server reported back
    pub fn merge_response(&mut self, response: &ResponseWindow) {
        if let Some(frame) = response.frame_size {
            self.frame_size = Some(frame);
        }
        if let Some(offset) = response.region_offset {
            self.region_offset = Some(offset);
        }
        if let Some(size) = response.region_size {
            self.region_size = Some(size);
        }
        if let Some(components) = &response.components {
            self.components = components.clone();
        }
        if let Some(layers) = response.layers {
            self.layers = Some(layers);
        }
    }

    /// Maps the request onto the codestream's actual resolutions
    ///
    /// An unset frame size means the full image rounded down. Regions are
    /// scaled proportionally when the requested frame is not an available one.
    pub fn resolve(&self, index: &dyn CodestreamIndex) -> Result<ResolvedWindow> {
        let (requested, round) = match self.frame_size {
            Some(frame) if frame.is_empty() => {
                return Err(Error::InvalidWindow("empty frame size".to_string()))
            }
            Some(frame) => (frame, self.round),
            None => (index.image_size(), RoundDirection::Down),
        };

        let discard_levels = index.discard_levels(requested, round);
        let frame = index.frame_size(discard_levels);

        let region = if self.has_region() {
            Some(self.scaled_region(requested, frame)?)
        } else {
            None
        };

        let components = expand_components(&self.components, index.num_components())?;
        let components = index.relevant_components(&components);
        let max_layers = index.num_layers();
        let layers = self.layers.map_or(max_layers, |l| l.min(max_layers));

        Ok(ResolvedWindow {
            discard_levels,
            frame,
            region,
            components,
            layers,
        })
    }

    fn scaled_region(&self, requested: Size, frame: Size) -> Result<Rect> {
        let offset = self.region_offset.unwrap_or_default();
        if offset.x >= requested.width || offset.y >= requested.height {
            return Err(Error::InvalidWindow(format!(
                "region offset ({}, {}) outside frame {}x{}",
                offset.x, offset.y, requested.width, requested.height
            )));
        }
        let size = self.region_size.unwrap_or(Size::new(
            requested.width - offset.x,
            requested.height - offset.y,
        ));
        if size.is_empty() {
            return Err(Error::InvalidWindow("empty region".to_string()));
        }

        let x1 = (offset.x + size.width).min(requested.width);
        let y1 = (offset.y + size.height).min(requested.height);

        if requested == frame {
            return Ok(Rect::from_corners(offset.x, offset.y, x1, y1));
        }

        let sx0 = offset.x * frame.width / requested.width;
        let sy0 = offset.y * frame.height / requested.height;
        let sx1 = div_ceil(x1 * frame.width, requested.width).clamp(sx0 + 1, frame.width);
        let sy1 = div_ceil(y1 * frame.height, requested.height).clamp(sy0 + 1, frame.height);
        Ok(Rect::from_corners(sx0, sy0, sx1, sy1))
    }
}

/// Expands component ranges, rejecting anything outside the image
fn expand_components(ranges: &[ComponentRange], available: u32) -> Result<Vec<u32>> {
    if ranges.is_empty() {
        return Ok((0..available).collect());
    }
    let mut components = Vec::new();
    for range in ranges {
        if range.first > range.last {
            return Err(Error::InvalidComponents(format!(
                "inverted range {}-{}",
                range.first, range.last
            )));
        }
        if range.last >= available {
            return Err(Error::InvalidComponents(format!(
                "component {} requested, image has {}",
                range.last, available
            )));
        }
        components.extend(range.first..=range.last);
    }
    components.sort_unstable();
    components.dedup();
    Ok(components)
}

/// A view window mapped onto an available resolution of the codestream
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWindow {
    pub discard_levels: u32,
    /// Actual frame size at `discard_levels`
    pub frame: Size,
    /// Region in `frame` coordinates, `None` for header-only requests
    pub region: Option<Rect>,
    pub components: Vec<u32>,
    pub layers: u32,
}

impl ResolvedWindow {
    /// Every precinct needed to render the window
    pub fn precincts(&self, index: &dyn CodestreamIndex) -> Vec<PrecinctInfo> {
        match &self.region {
            Some(region) => index.precincts(self.discard_levels, region, &self.components),
            None => Vec::new(),
        }
    }

    /// Equivalent request expressed on the exact frame
    pub fn to_view_window(&self) -> ViewWindow {
        ViewWindow {
            frame_size: Some(self.frame),
            region_offset: self.region.map(|r| r.offset()),
            region_size: self.region.map(|r| r.size()),
            components: ComponentRange::compress(&self.components),
            layers: Some(self.layers),
            round: RoundDirection::Down,
        }
    }
}

/// View-window fields returned by a server; absent means "as requested"
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResponseWindow {
    pub frame_size: Option<Size>,
    pub region_offset: Option<Point>,
    pub region_size: Option<Size>,
    pub components: Option<Vec<ComponentRange>>,
    pub layers: Option<u32>,
}

impl ResponseWindow {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::RegularCodestream;

    fn geometry() -> RegularCodestream {
        RegularCodestream::new(1024, 1024)
            .with_levels(3)
            .with_precinct_exp(8, 8)
            .with_layers(4)
            .with_components(3)
    }

    #[test]
    fn test_unset_frame_means_full_image() {
        let window = ViewWindow {
            region_offset: Some(Point::new(0, 0)),
            region_size: Some(Size::new(100, 100)),
            ..ViewWindow::default()
        };
        let resolved = window.resolve(&geometry()).unwrap();
        assert_eq!(resolved.discard_levels, 0);
        assert_eq!(resolved.frame, Size::new(1024, 1024));
        assert_eq!(resolved.region, Some(Rect::new(0, 0, 100, 100)));
        assert_eq!(resolved.components, vec![0, 1, 2]);
        assert_eq!(resolved.layers, 4);
    }

    #[test]
    fn test_region_scaled_to_available_frame() {
        let window = ViewWindow::region(Size::new(600, 600), Point::new(300, 0), Size::new(300, 300))
            .with_layers(9);
        let resolved = window.resolve(&geometry()).unwrap();
        assert_eq!(resolved.frame, Size::new(512, 512));
        assert_eq!(resolved.region, Some(Rect::new(256, 0, 256, 256)));
        assert_eq!(resolved.layers, 4);
    }

    #[test]
    fn test_region_clamped_to_frame() {
        let window = ViewWindow::region(Size::new(512, 512), Point::new(400, 400), Size::new(300, 300));
        let resolved = window.resolve(&geometry()).unwrap();
        assert_eq!(resolved.region, Some(Rect::new(400, 400, 112, 112)));
    }

    #[test]
    fn test_offset_outside_frame_rejected() {
        let window = ViewWindow::region(Size::new(512, 512), Point::new(512, 0), Size::new(10, 10));
        assert!(matches!(window.resolve(&geometry()), Err(Error::InvalidWindow(_))));
    }

    #[test]
    fn test_component_validation() {
        let window = ViewWindow::region(Size::new(512, 512), Point::new(0, 0), Size::new(10, 10))
            .with_components(vec![ComponentRange::new(1, 3)]);
        assert!(matches!(window.resolve(&geometry()), Err(Error::InvalidComponents(_))));

        let inverted = ViewWindow::new().with_components(vec![ComponentRange::new(2, 1)]);
        assert!(matches!(inverted.resolve(&geometry()), Err(Error::InvalidComponents(_))));
    }

    #[test]
    fn test_header_only_window_has_no_precincts() {
        let g = geometry();
        let resolved = ViewWindow::new().resolve(&g).unwrap();
        assert!(resolved.region.is_none());
        assert!(resolved.precincts(&g).is_empty());
    }

    #[test]
    fn test_merge_response_keeps_unreported_fields() {
        let mut window = ViewWindow::region(Size::new(512, 512), Point::new(10, 10), Size::new(100, 100))
            .with_layers(3);
        window.merge_response(&ResponseWindow {
            region_size: Some(Size::new(90, 90)),
            layers: Some(2),
            ..ResponseWindow::default()
        });
        assert_eq!(window.frame_size, Some(Size::new(512, 512)));
        assert_eq!(window.region_offset, Some(Point::new(10, 10)));
        assert_eq!(window.region_size, Some(Size::new(90, 90)));
        assert_eq!(window.layers, Some(2));
    }

    #[test]
    fn test_compress_components() {
        assert_eq!(
            ComponentRange::compress(&[0, 1, 2, 5, 7, 8]),
            vec![
                ComponentRange::new(0, 2),
                ComponentRange::single(5),
                ComponentRange::new(7, 8)
            ]
        );
    }

    #[test]
    fn test_reset() {
        let mut window = ViewWindow::region(Size::new(1, 1), Point::new(0, 0), Size::new(1, 1));
        window.reset();
        assert_eq!(window, ViewWindow::new());
        assert!(!window.has_region());
    }
}
