//! Cache descriptors: telling a stateless server what the client already holds

use std::fmt;

use serde::{Deserialize, Serialize};

use super::PrecinctLedger;
use crate::codestream::CodestreamIndex;
use crate::error::{Error, Result};
use crate::window::ResolvedWindow;

/// How precincts are named in a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorForm {
    /// By in-class identifier
    Explicit,
    /// By tile, component, resolution and precinct indices
    Implicit,
}

/// How much of each precinct is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorQualifier {
    /// Only complete precincts
    Wildcard,
    /// Consecutive precincts merged into index ranges
    IndexRange,
    NumberOfLayers,
    NumberOfBytes,
}

/// A validated form/qualifier pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDescriptor {
    pub form: DescriptorForm,
    pub qualifier: DescriptorQualifier,
}

impl CacheDescriptor {
    /// Rejects explicit index ranges and implicit byte counts
    pub fn new(form: DescriptorForm, qualifier: DescriptorQualifier) -> Result<Self> {
        let descriptor = Self { form, qualifier };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<()> {
        match (self.form, self.qualifier) {
            (DescriptorForm::Explicit, DescriptorQualifier::IndexRange)
            | (DescriptorForm::Implicit, DescriptorQualifier::NumberOfBytes) => {
                Err(Error::InvalidCacheDescriptor {
                    form: self.form,
                    qualifier: self.qualifier,
                })
            }
            _ => Ok(()),
        }
    }
}

impl Default for CacheDescriptor {
    fn default() -> Self {
        Self {
            form: DescriptorForm::Explicit,
            qualifier: DescriptorQualifier::NumberOfLayers,
        }
    }
}

/// Inclusive index span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpan {
    pub first: u64,
    pub last: u64,
}

impl IndexSpan {
    pub fn single(index: u64) -> Self {
        Self { first: index, last: index }
    }

    pub fn contains(&self, index: u64) -> bool {
        self.first <= index && index <= self.last
    }
}

impl fmt::Display for IndexSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

/// Amount of a precinct held by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Amount {
    Layers(u32),
    Bytes(u64),
}

/// One cache-model statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelElement {
    /// `amount` of `None` means the whole data-bin
    Explicit { id: u64, amount: Option<Amount> },
    Implicit {
        tiles: IndexSpan,
        components: IndexSpan,
        resolutions: IndexSpan,
        precincts: IndexSpan,
        layers: Option<u32>,
    },
}

impl fmt::Display for ModelElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelElement::Explicit { id, amount } => {
                write!(f, "P{}", id)?;
                match amount {
                    Some(Amount::Layers(n)) => write!(f, ":L{}", n),
                    Some(Amount::Bytes(n)) => write!(f, ":{}", n),
                    None => Ok(()),
                }
            }
            ModelElement::Implicit {
                tiles,
                components,
                resolutions,
                precincts,
                layers,
            } => {
                write!(f, "t{}c{}r{}p{}", tiles, components, resolutions, precincts)?;
                match layers {
                    Some(n) => write!(f, ":L{}", n),
                    None => Ok(()),
                }
            }
        }
    }
}

/// Held progress of one precinct, in implicit coordinates
#[derive(Clone, Copy)]
struct Held {
    tile: u64,
    component: u64,
    resolution: u64,
    precinct: u64,
    layers: u32,
}

impl Held {
    fn element(&self, layers: Option<u32>) -> ModelElement {
        ModelElement::Implicit {
            tiles: IndexSpan::single(self.tile),
            components: IndexSpan::single(self.component),
            resolutions: IndexSpan::single(self.resolution),
            precincts: IndexSpan::single(self.precinct),
            layers,
        }
    }
}

impl PrecinctLedger {
    /// Describes what is held of the precincts relevant to `window`
    pub fn cache_descriptor(
        &self,
        window: &ResolvedWindow,
        index: &dyn CodestreamIndex,
        descriptor: CacheDescriptor,
    ) -> Result<Vec<ModelElement>> {
        descriptor.validate()?;
        let max_layers = index.num_layers();

        let mut held = Vec::new();
        for info in window.precincts(index) {
            let entry = match self.entries.get(&info.address.id) {
                Some(entry) if entry.delivered_layers > 0 => entry,
                _ => continue,
            };
            held.push((
                info.address.id,
                entry.bytes_received,
                Held {
                    tile: info.address.tile as u64,
                    component: info.address.component as u64,
                    resolution: info.address.resolution as u64,
                    precinct: info.address.precinct,
                    layers: entry.delivered_layers,
                },
            ));
        }

        let elements = match (descriptor.form, descriptor.qualifier) {
            (DescriptorForm::Explicit, DescriptorQualifier::Wildcard) => held
                .iter()
                .filter(|(_, _, h)| h.layers >= max_layers)
                .map(|(id, _, _)| ModelElement::Explicit { id: *id, amount: None })
                .collect(),
            (DescriptorForm::Explicit, DescriptorQualifier::NumberOfLayers) => held
                .iter()
                .map(|(id, _, h)| ModelElement::Explicit {
                    id: *id,
                    amount: Some(Amount::Layers(h.layers)),
                })
                .collect(),
            (DescriptorForm::Explicit, DescriptorQualifier::NumberOfBytes) => held
                .iter()
                .map(|(id, bytes, _)| ModelElement::Explicit {
                    id: *id,
                    amount: Some(Amount::Bytes(*bytes)),
                })
                .collect(),
            (DescriptorForm::Implicit, DescriptorQualifier::Wildcard) => held
                .iter()
                .filter(|(_, _, h)| h.layers >= max_layers)
                .map(|(_, _, h)| h.element(None))
                .collect(),
            (DescriptorForm::Implicit, DescriptorQualifier::NumberOfLayers) => held
                .iter()
                .map(|(_, _, h)| h.element(Some(h.layers)))
                .collect(),
            (DescriptorForm::Implicit, DescriptorQualifier::IndexRange) => {
                merge_ranges(held.into_iter().map(|(_, _, h)| h).collect())
            }
            // rejected by validate() above
            (DescriptorForm::Explicit, DescriptorQualifier::IndexRange)
            | (DescriptorForm::Implicit, DescriptorQualifier::NumberOfBytes) => Vec::new(),
        };
        Ok(elements)
    }
}

/// Merges runs of consecutive precincts sharing tile, component, resolution
/// and layer count
fn merge_ranges(mut held: Vec<Held>) -> Vec<ModelElement> {
    held.sort_by_key(|h| (h.tile, h.component, h.resolution, h.layers, h.precinct));

    let mut elements = Vec::new();
    let mut run: Option<(Held, u64)> = None;
    for h in held {
        run = match run {
            Some((start, last))
                if start.tile == h.tile
                    && start.component == h.component
                    && start.resolution == h.resolution
                    && start.layers == h.layers
                    && last + 1 == h.precinct =>
            {
                Some((start, h.precinct))
            }
            Some((start, last)) => {
                elements.push(span_element(start, last));
                Some((h, h.precinct))
            }
            None => Some((h, h.precinct)),
        };
    }
    if let Some((start, last)) = run {
        elements.push(span_element(start, last));
    }
    elements
}

fn span_element(start: Held, last: u64) -> ModelElement {
    ModelElement::Implicit {
        tiles: IndexSpan::single(start.tile),
        components: IndexSpan::single(start.component),
        resolutions: IndexSpan::single(start.resolution),
        precincts: IndexSpan {
            first: start.precinct,
            last,
        },
        layers: Some(start.layers),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::RegularCodestream;
    use crate::types::{Point, Size};
    use crate::window::ViewWindow;

    fn setup() -> (RegularCodestream, PrecinctLedger, ResolvedWindow) {
        let g = RegularCodestream::new(1024, 1024)
            .with_levels(3)
            .with_precinct_exp(8, 8)
            .with_layers(4);
        let ledger = PrecinctLedger::new();
        let window = ViewWindow::region(Size::new(1024, 1024), Point::new(0, 0), Size::new(1024, 1024))
            .resolve(&g)
            .unwrap();
        (g, ledger, window)
    }

    #[test]
    fn test_illegal_combinations_rejected() {
        assert!(CacheDescriptor::new(DescriptorForm::Explicit, DescriptorQualifier::IndexRange).is_err());
        assert!(CacheDescriptor::new(DescriptorForm::Implicit, DescriptorQualifier::NumberOfBytes).is_err());
        assert!(CacheDescriptor::new(DescriptorForm::Implicit, DescriptorQualifier::IndexRange).is_ok());
        assert!(CacheDescriptor::new(DescriptorForm::Explicit, DescriptorQualifier::NumberOfBytes).is_ok());
    }

    #[test]
    fn test_explicit_layers() {
        let (g, ledger, window) = setup();
        ledger.mark_received(0, 2, 10);
        ledger.mark_received(1, 4, 20);
        let descriptor = CacheDescriptor::new(DescriptorForm::Explicit, DescriptorQualifier::NumberOfLayers).unwrap();
        let elements = ledger.cache_descriptor(&window, &g, descriptor).unwrap();
        let text: Vec<String> = elements.iter().map(|e| e.to_string()).collect();
        assert_eq!(text, vec!["P0:L2", "P1:L4"]);
    }

    #[test]
    fn test_explicit_wildcard_reports_complete_only() {
        let (g, ledger, window) = setup();
        ledger.mark_received(0, 2, 10);
        ledger.mark_received(1, 4, 20);
        let descriptor = CacheDescriptor::new(DescriptorForm::Explicit, DescriptorQualifier::Wildcard).unwrap();
        let elements = ledger.cache_descriptor(&window, &g, descriptor).unwrap();
        assert_eq!(elements, vec![ModelElement::Explicit { id: 1, amount: None }]);
    }

    #[test]
    fn test_explicit_bytes() {
        let (g, ledger, window) = setup();
        ledger.mark_received(3, 1, 77);
        let descriptor = CacheDescriptor::new(DescriptorForm::Explicit, DescriptorQualifier::NumberOfBytes).unwrap();
        let elements = ledger.cache_descriptor(&window, &g, descriptor).unwrap();
        assert_eq!(elements[0].to_string(), "P3:77");
    }

    #[test]
    fn test_implicit_index_ranges_merge_runs() {
        let (g, ledger, window) = setup();
        // resolution 3 holds precincts 6..22 in a 4x4 grid
        for p in [0u64, 1, 2, 5] {
            ledger.mark_received(g.in_class_id(0, 0, 3, p), 2, 1);
        }
        ledger.mark_received(g.in_class_id(0, 0, 3, 3), 1, 1);

        let descriptor = CacheDescriptor::new(DescriptorForm::Implicit, DescriptorQualifier::IndexRange).unwrap();
        let text: Vec<String> = ledger
            .cache_descriptor(&window, &g, descriptor)
            .unwrap()
            .iter()
            .map(|e| e.to_string())
            .collect();
        assert_eq!(text, vec!["t0c0r3p3:L1", "t0c0r3p0-2:L2", "t0c0r3p5:L2"]);
    }

    #[test]
    fn test_implicit_layers_single_entries() {
        let (g, ledger, window) = setup();
        ledger.mark_received(g.in_class_id(0, 0, 2, 1), 3, 1);
        let descriptor = CacheDescriptor::new(DescriptorForm::Implicit, DescriptorQualifier::NumberOfLayers).unwrap();
        let elements = ledger.cache_descriptor(&window, &g, descriptor).unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].to_string(), "t0c0r2p1:L3");
    }

    #[test]
    fn test_precincts_outside_window_ignored() {
        let (g, ledger, _) = setup();
        let corner = ViewWindow::region(Size::new(1024, 1024), Point::new(0, 0), Size::new(100, 100))
            .resolve(&g)
            .unwrap();
        ledger.mark_received(g.in_class_id(0, 0, 3, 15), 4, 1);
        let elements = ledger
            .cache_descriptor(&corner, &g, CacheDescriptor::default())
            .unwrap();
        assert!(elements.is_empty());
    }
}
