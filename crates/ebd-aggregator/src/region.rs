//! Region resolution and the region hierarchy
//!
//! eBird region codes are dash-separated: `US` (country), `US-CA`
//! (subnational1), `US-CA-001` (subnational2). Upstream hotspot metadata
//! sometimes carries truncated codes such as `CO-` or `US-CA-`; those are
//! rejected here and the hotspot falls back to the next level up, so an
//! invalid code never reaches the database or a pack.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::Hotspot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionLevel {
    Country,
    Subnational1,
    Subnational2,
}

impl RegionLevel {
    /// Number of dash-separated parts in a code at this level
    pub fn depth(self) -> usize {
        match self {
            RegionLevel::Country => 1,
            RegionLevel::Subnational1 => 2,
            RegionLevel::Subnational2 => 3,
        }
    }

    fn from_depth(depth: usize) -> Option<Self> {
        match depth {
            1 => Some(RegionLevel::Country),
            2 => Some(RegionLevel::Subnational1),
            3 => Some(RegionLevel::Subnational2),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegionLevel::Country => "country",
            RegionLevel::Subnational1 => "subnational1",
            RegionLevel::Subnational2 => "subnational2",
        }
    }
}

impl std::fmt::Display for RegionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True if `code` is a well-formed code at exactly `level`
pub fn is_valid_code(code: &str, level: RegionLevel) -> bool {
    let parts: Vec<&str> = code.split('-').collect();
    parts.len() == level.depth()
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Level of a well-formed code of any depth
pub fn level_of(code: &str) -> Option<RegionLevel> {
    let level = RegionLevel::from_depth(code.split('-').count())?;
    is_valid_code(code, level).then_some(level)
}

/// A validated region code
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionCode {
    code: String,
    level: RegionLevel,
}

impl RegionCode {
    pub fn parse(code: &str) -> Option<Self> {
        let code = code.trim();
        level_of(code).map(|level| Self {
            code: code.to_string(),
            level,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.code
    }

    pub fn level(&self) -> RegionLevel {
        self.level
    }

    pub fn country(&self) -> &str {
        self.code.split('-').next().unwrap_or(&self.code)
    }

    /// The enclosing region, `None` for a country
    pub fn parent(&self) -> Option<RegionCode> {
        let (prefix, _) = self.code.rsplit_once('-')?;
        RegionCode::parse(prefix)
    }

    /// Codes from the country down to and including this one
    pub fn chain(&self) -> Vec<RegionCode> {
        let mut chain = vec![self.clone()];
        let mut current = self.parent();
        while let Some(code) = current {
            current = code.parent();
            chain.push(code);
        }
        chain.reverse();
        chain
    }
}

impl std::fmt::Display for RegionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.code)
    }
}

fn valid_at(code: Option<&str>, level: RegionLevel) -> Option<&str> {
    code.map(str::trim).filter(|c| is_valid_code(c, level))
}

/// Most specific valid region for a hotspot's raw codes
///
/// Order: subnational2, subnational1, country. A subnational code whose
/// country prefix disagrees with a valid country code is treated as invalid.
/// When the country code itself is unusable it is recovered from the prefix
/// of a valid subnational code. Returns `None` only if nothing is usable.
pub fn resolve(
    country: Option<&str>,
    subnational1: Option<&str>,
    subnational2: Option<&str>,
) -> Option<RegionCode> {
    let country = valid_at(country, RegionLevel::Country);
    let agrees = |code: &str| match country {
        Some(cc) => code.split('-').next() == Some(cc),
        None => true,
    };

    if let Some(code) = valid_at(subnational2, RegionLevel::Subnational2).filter(|c| agrees(c)) {
        return RegionCode::parse(code);
    }
    if let Some(code) = valid_at(subnational1, RegionLevel::Subnational1).filter(|c| agrees(c)) {
        return RegionCode::parse(code);
    }
    if let Some(code) = country {
        return RegionCode::parse(code);
    }

    [subnational1, subnational2]
        .into_iter()
        .flatten()
        .filter_map(|raw| raw.trim().split('-').next())
        .find_map(RegionCode::parse)
}

pub fn resolve_hotspot(hotspot: &Hotspot) -> Option<RegionCode> {
    resolve(
        Some(hotspot.country_code.as_str()),
        hotspot.subnational1_code.as_deref(),
        hotspot.subnational2_code.as_deref(),
    )
}

/// A node of the region hierarchy
#[derive(Debug, Clone, PartialEq)]
pub struct RegionNode {
    pub code: String,
    pub level: RegionLevel,
    pub parent: Option<String>,
    /// Every hotspot resolving to this region or a descendant, sorted by id
    pub hotspots: Vec<String>,
}

/// Region hierarchy keyed by code
///
/// Built with a fixed-depth prefix walk from each hotspot's resolved code, so
/// finding every pack that contains a hotspot never needs parent pointers.
#[derive(Debug, Clone, Default)]
pub struct RegionTree {
    nodes: BTreeMap<String, RegionNode>,
    unresolved: Vec<String>,
}

impl RegionTree {
    pub fn build<'a>(hotspots: impl IntoIterator<Item = &'a Hotspot>) -> Self {
        let mut tree = RegionTree::default();

        for hotspot in hotspots {
            let Some(region) = resolve_hotspot(hotspot) else {
                tree.unresolved.push(hotspot.id.clone());
                continue;
            };

            for code in region.chain() {
                let node = tree
                    .nodes
                    .entry(code.as_str().to_string())
                    .or_insert_with(|| RegionNode {
                        code: code.as_str().to_string(),
                        level: code.level(),
                        parent: code.parent().map(|p| p.as_str().to_string()),
                        hotspots: Vec::new(),
                    });
                node.hotspots.push(hotspot.id.clone());
            }
        }

        for node in tree.nodes.values_mut() {
            node.hotspots.sort();
            node.hotspots.dedup();
        }
        tree.unresolved.sort();

        tree
    }

    pub fn get(&self, code: &str) -> Option<&RegionNode> {
        self.nodes.get(code)
    }

    /// All regions in code order
    pub fn nodes(&self) -> impl Iterator<Item = &RegionNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Hotspots with no usable region code, excluded from every pack
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }

}
