//! Rendering received data into pixels

use crate::cache::PrecinctLedger;
use crate::codestream::CodestreamIndex;
use crate::error::{Error, Result};
use crate::window::ViewWindow;

/// Turns held precinct data into an image of a window
pub trait Decoder: Send + Sync {
    /// Renders `response`, the window the server actually delivered for
    /// `request`, from what the ledger holds
    fn decode(
        &self,
        request: &ViewWindow,
        response: &ViewWindow,
        ledger: &PrecinctLedger,
        index: &dyn CodestreamIndex,
    ) -> Result<Vec<u8>>;
}

/// Renders delivered quality instead of image content
///
/// Each output byte is the fraction of requested layers held by the least
/// complete precinct covering that pixel, scaled to `0..=255`. Rows are stored
/// top to bottom, one byte per pixel of the resolved region.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoverageDecoder;

impl Decoder for CoverageDecoder {
    fn decode(
        &self,
        _request: &ViewWindow,
        response: &ViewWindow,
        ledger: &PrecinctLedger,
        index: &dyn CodestreamIndex,
    ) -> Result<Vec<u8>> {
        let resolved = response.resolve(index)?;
        let region = match resolved.region {
            Some(region) => region,
            None => return Ok(Vec::new()),
        };
        if resolved.layers == 0 {
            return Ok(vec![u8::MAX; region.area() as usize]);
        }

        let width = region.width as usize;
        let mut held = vec![u32::MAX; region.area() as usize];
        for info in resolved.precincts(index) {
            let covered = match info.bounds.intersection(&region) {
                Some(covered) => covered,
                None => continue,
            };
            let layers = ledger.delivered_layers(info.address.id).min(resolved.layers);
            for y in covered.y..covered.bottom() {
                let row = (y - region.y) as usize * width;
                for x in covered.x..covered.right() {
                    let cell = &mut held[row + (x - region.x) as usize];
                    *cell = (*cell).min(layers);
                }
            }
        }

        if held.iter().any(|&l| l == u32::MAX) {
            return Err(Error::Decode(format!(
                "region {:?} not fully covered by precincts",
                region
            )));
        }
        Ok(held
            .into_iter()
            .map(|l| (l as u64 * 255 / resolved.layers as u64) as u8)
            .collect())
    }
}
