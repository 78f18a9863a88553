use std::fmt;

use anyhow::{Context, Result};
use regex::Regex;

use crate::store::Predicate;

/// Long-axis cine view a model trains on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum View {
    #[value(name = "2ch")]
    TwoChamber,
    #[value(name = "4ch")]
    FourChamber,
}

impl View {
    pub fn prefix(&self) -> &'static str {
        match self {
            View::TwoChamber => "2ch",
            View::FourChamber => "4ch",
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Which frames of a series are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FrameSelection {
    /// Only the first frame of each series.
    First,
    /// Every frame of the series, stacked in time order.
    Stack,
}

/// Study and zero-based frame index of a stored image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameKey {
    pub study: u32,
    pub frame: usize,
}

/// Recognises `<study>/study/<view>_<series>/IM-<series>-<frame>.dcm`
/// paths, wherever they sit below the data root.
#[derive(Debug, Clone)]
pub struct FramePattern {
    regex: Regex,
    selection: FrameSelection,
}

impl FramePattern {
    pub fn new(view: View, selection: FrameSelection) -> Result<Self> {
        let pattern = match selection {
            FrameSelection::First => format!(
                r"(?:^|/)([0-9]+)/study/{}_[0-9]+/[^/]*-0001\.dcm$",
                view.prefix()
            ),
            FrameSelection::Stack => format!(
                r"(?:^|/)([0-9]+)/study/{}_[0-9]+/IM-[0-9]+-0*([1-9][0-9]*)(?:-0002)?\.dcm$",
                view.prefix()
            ),
        };
        let regex = Regex::new(&pattern).context("compiling frame pattern")?;
        Ok(Self { regex, selection })
    }

    /// Study and frame of `path`, or `None` when the path is not a frame
    /// of the selected view.
    pub fn locate(&self, path: &str) -> Option<FrameKey> {
        let caps = self.regex.captures(path)?;
        let study = caps.get(1)?.as_str().parse().ok()?;
        let frame = match self.selection {
            FrameSelection::First => 0,
            FrameSelection::Stack => caps.get(2)?.as_str().parse::<usize>().ok()? - 1,
        };
        Some(FrameKey { study, frame })
    }

    /// Store predicate selecting the paths this pattern accepts.
    pub fn predicate(&self) -> Predicate {
        Predicate::Matches(self.regex.clone())
    }
}
