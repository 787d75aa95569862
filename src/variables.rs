//! One-shot variable access.
//!
//! A [`VariableRequest`] names a simulator variable the way calculator code
//! would, by type prefix plus name (or numeric id), optional index and
//! optional unit. The server reads or writes it once; nothing is tracked.

use crate::codec::STRSZ_CMD;
use crate::error::{Result, WasimError};

/// Types that can be referenced by numeric id.
pub fn is_indexed_variable_type(variable_type: char) -> bool {
    matches!(variable_type, 'A' | 'L' | 'T')
}

/// Types whose reads and writes take a unit.
pub fn is_unit_based_variable_type(variable_type: char) -> bool {
    matches!(variable_type, 'A' | 'C' | 'E' | 'L' | 'P')
}

/// Types that can be written.
pub fn is_settable_variable_type(variable_type: char) -> bool {
    matches!(variable_type, 'A' | 'C' | 'H' | 'K' | 'L' | 'Z')
}

/// A variable to get or set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableRequest {
    /// Single-character type prefix (`A`, `L`, `T`, `E`, ...).
    pub variable_type: char,
    /// Ignored when `variable_id` is set and the type is indexed.
    pub variable_name: String,
    pub unit_name: String,
    /// Numeric id, `-1` when unused. Overrides the name for indexed types.
    pub variable_id: i32,
    /// Numeric unit id, `-1` when unused. Overrides the unit name.
    pub unit_id: i32,
    /// Index for indexed simulator variables, `0` for none.
    pub sim_var_index: u8,
    /// Create a missing `L` variable instead of failing.
    pub create_l_var: bool,
}

impl Default for VariableRequest {
    fn default() -> Self {
        Self {
            variable_type: 'L',
            variable_name: String::new(),
            unit_name: String::new(),
            variable_id: -1,
            unit_id: -1,
            sim_var_index: 0,
            create_l_var: false,
        }
    }
}

impl VariableRequest {
    /// Any variable type, by name.
    pub fn new(variable_type: char, name: impl Into<String>) -> Self {
        Self {
            variable_type,
            variable_name: name.into(),
            ..Default::default()
        }
    }

    /// A local (`L`) variable by name.
    pub fn local(name: impl Into<String>) -> Self {
        Self::new('L', name)
    }

    /// A simulator (`A`) variable with unit and optional index.
    pub fn sim_var(name: impl Into<String>, unit: impl Into<String>, index: u8) -> Self {
        Self {
            unit_name: unit.into(),
            sim_var_index: index,
            ..Self::new('A', name)
        }
    }

    /// A variable by numeric id.
    pub fn by_id(variable_type: char, variable_id: i32) -> Self {
        Self {
            variable_type,
            variable_id,
            ..Default::default()
        }
    }

    pub fn unit(mut self, unit_name: impl Into<String>) -> Self {
        self.unit_name = unit_name.into();
        self
    }

    pub fn unit_id(mut self, unit_id: i32) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create_l_var = create;
        self
    }

    /// True when a get or set should create a missing `L` variable.
    pub(crate) fn creates(&self) -> bool {
        self.create_l_var && self.variable_type == 'L'
    }

    /// Text argument of a `Get`/`Set` command: `name[:index][,unit]`, with
    /// ids substituted where the type allows them. Only `L` variables are
    /// set by id.
    pub(crate) fn command_string(&self, for_set: bool) -> Result<String> {
        let indexed = if for_set {
            self.variable_type == 'L'
        } else {
            is_indexed_variable_type(self.variable_type)
        };

        let mut text = if indexed && self.variable_id > -1 {
            self.variable_id.to_string()
        } else {
            self.variable_name.clone()
        };
        if text.is_empty() {
            return Err(WasimError::invalid("variable name is empty"));
        }

        if self.variable_type == 'A' && self.sim_var_index > 0 {
            text.push(':');
            text.push_str(&self.sim_var_index.to_string());
        }
        if is_unit_based_variable_type(self.variable_type) {
            if indexed && self.unit_id > -1 {
                text.push(',');
                text.push_str(&self.unit_id.to_string());
            } else if !self.unit_name.is_empty() {
                text.push(',');
                text.push_str(&self.unit_name);
            }
        }

        if text.len() >= STRSZ_CMD {
            return Err(WasimError::invalid(format!(
                "variable command exceeds {} bytes",
                STRSZ_CMD - 1
            )));
        }
        Ok(text)
    }
}

/// Result of a `Get`, `Exec` or `Lookup` answered by the server.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandValue {
    /// Numeric result (`f_data` of the `Ack`).
    pub number: f64,
    /// String result (`s_data` of the `Ack`), empty if none.
    pub text: String,
}
