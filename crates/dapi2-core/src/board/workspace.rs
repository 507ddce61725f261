//! Workspaces: the operating modes a board exposes.
//!
//! The peripheral-configuration array `pcr[]` declares one workspace
//! per non-zero entry; `par` selects the active one, with 0 meaning
//! standby. Standby always exists.

use std::fmt;

/// One operating mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Value written to `par` to activate this workspace (0 = standby).
    pub par: u16,
    pub name: String,
    /// The `pcr` configuration word, 0 for standby.
    pub config: u16,
}

impl Workspace {
    pub fn is_standby(&self) -> bool {
        self.par == 0
    }
}

impl fmt::Display for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (par={})", self.name, self.par)
    }
}

/// The workspaces of one board, with at most one active.
#[derive(Debug, Default)]
pub struct Workspaces {
    list: Vec<Workspace>,
    active: Option<usize>,
}

impl Workspaces {
    /// Builds the workspace list from the `pcr` values: standby plus
    /// one workspace per non-zero configuration word.
    pub fn from_pcr(pcr: &[u16]) -> Self {
        let mut list = vec![Workspace {
            par: 0,
            name: "standby".to_string(),
            config: 0,
        }];
        for (i, &config) in pcr.iter().enumerate() {
            if config != 0 {
                let par = (i + 1) as u16;
                list.push(Workspace {
                    par,
                    name: format!("peripheral {par}"),
                    config,
                });
            }
        }
        Self { list, active: None }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// True when standby is the only workspace.
    pub fn standby_only(&self) -> bool {
        self.list.iter().all(Workspace::is_standby)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Workspace> {
        self.list.iter()
    }

    pub fn by_par(&self, par: u16) -> Option<&Workspace> {
        self.list.iter().find(|w| w.par == par)
    }

    pub fn active(&self) -> Option<&Workspace> {
        self.active.map(|i| &self.list[i])
    }

    /// Marks the workspace selected by `par` active. Returns false
    /// when no workspace carries that value.
    pub fn activate_by_par(&mut self, par: u16) -> bool {
        match self.list.iter().position(|w| w.par == par) {
            Some(i) => {
                self.active = Some(i);
                true
            }
            None => false,
        }
    }
}
