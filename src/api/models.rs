use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::prefetch::{EngineState, PrefetchStats};
use crate::session::SessionPhase;
use crate::types::{Point, Size};
use crate::window::{ComponentRange, RoundDirection, ViewWindow};

/// View window given as query parameters
///
/// Without `width` and `height` the request is header-only. Components are a
/// comma separated list of indices or `first-last` ranges.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WindowQuery {
    pub frame_width: Option<u64>,
    pub frame_height: Option<u64>,
    #[serde(default)]
    pub x: u64,
    #[serde(default)]
    pub y: u64,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub components: Option<String>,
    pub layers: Option<u32>,
    #[serde(default)]
    pub round: RoundDirection,
    #[serde(default = "default_record")]
    pub record: bool,
}

fn default_record() -> bool {
    true
}

impl WindowQuery {
    pub fn to_window(&self) -> Result<ViewWindow> {
        let mut window = ViewWindow::new().with_round(self.round);
        window.frame_size = match (self.frame_width, self.frame_height) {
            (Some(w), Some(h)) => Some(Size::new(w, h)),
            (None, None) => None,
            _ => {
                return Err(Error::InvalidWindow(
                    "frame_width and frame_height go together".to_string(),
                ))
            }
        };
        match (self.width, self.height) {
            (Some(w), Some(h)) => {
                window.region_offset = Some(Point::new(self.x, self.y));
                window.region_size = Some(Size::new(w, h));
            }
            (None, None) => {}
            _ => {
                return Err(Error::InvalidWindow(
                    "width and height go together".to_string(),
                ))
            }
        }
        if let Some(components) = &self.components {
            window.components = parse_components(components)?;
        }
        window.layers = self.layers;
        Ok(window)
    }
}

fn parse_components(text: &str) -> Result<Vec<ComponentRange>> {
    let number = |s: &str| {
        s.trim()
            .parse::<u32>()
            .map_err(|_| Error::InvalidComponents(format!("'{}' is not a component", s)))
    };
    text.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| match part.split_once('-') {
            Some((first, last)) => Ok(ComponentRange::new(number(first)?, number(last)?)),
            None => Ok(ComponentRange::single(number(part)?)),
        })
        .collect()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AvailabilityResponse {
    pub available: bool,
    pub cached_precincts: usize,
    pub cached_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpeedResponse {
    pub bytes_per_second: f64,
    pub phase: SessionPhase,
}

#[derive(Debug, Serialize)]
pub struct PrefetchStatusResponse {
    pub state: EngineState,
    pub stats: PrefetchStats,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseResponse {
    pub phase: SessionPhase,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_components() {
        assert_eq!(
            parse_components("0-2, 4").unwrap(),
            vec![ComponentRange::new(0, 2), ComponentRange::single(4)]
        );
        assert!(matches!(
            parse_components("a"),
            Err(Error::InvalidComponents(_))
        ));
    }

    #[test]
    fn test_query_to_window() {
        let query = WindowQuery {
            frame_width: Some(1024),
            frame_height: Some(1024),
            x: 16,
            width: Some(64),
            height: Some(32),
            layers: Some(2),
            ..WindowQuery::default()
        };
        let window = query.to_window().unwrap();
        assert_eq!(window.region_offset, Some(Point::new(16, 0)));
        assert_eq!(window.region_size, Some(Size::new(64, 32)));
        assert_eq!(window.layers, Some(2));
    }

    #[test]
    fn test_half_region_rejected() {
        let query = WindowQuery {
            width: Some(64),
            ..WindowQuery::default()
        };
        assert!(matches!(query.to_window(), Err(Error::InvalidWindow(_))));
    }
}
