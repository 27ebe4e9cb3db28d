// options.rs — Lowering options and the output request
//
// Preconditions: none.
// Postconditions: `LowerOptions::from_json` accepts any subset of fields and
//                 fills the rest with defaults; unknown fields are rejected.
// Failure modes: malformed JSON → `serde_json::Error`.
// Side effects: none.

use serde::{Deserialize, Serialize};

/// Policy knobs of a lowering run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LowerOptions {
    /// Iterations of the recursive bounds fixed point before giving up.
    pub max_fixed_point_iterations: usize,
    /// Largest extent a recursive dimension may grow to.
    pub max_region_growth: i64,
    pub max_allocation_bytes: i64,
    /// Emit W0300 when some but not all update stages were scheduled.
    pub warn_partial_schedules: bool,
}

impl Default for LowerOptions {
    fn default() -> Self {
        LowerOptions {
            max_fixed_point_iterations: 64,
            max_region_growth: 1 << 20,
            max_allocation_bytes: i64::from(i32::MAX),
            warn_partial_schedules: true,
        }
    }
}

impl LowerOptions {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// The box of one output Func the caller wants computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRequest {
    pub func: String,
    /// `(min, extent)` per dimension, in argument order.
    pub region: Vec<(i64, i64)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub outputs: Vec<OutputRequest>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request `func` over the given `(min, extent)` box.
    pub fn output(mut self, func: &str, region: &[(i64, i64)]) -> Self {
        self.outputs.push(OutputRequest {
            func: func.to_string(),
            region: region.to_vec(),
        });
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|o| o.func.as_str())
    }

    pub fn get(&self, func: &str) -> Option<&OutputRequest> {
        self.outputs.iter().find(|o| o.func == func)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let opts = LowerOptions::from_json(r#"{ "max_fixed_point_iterations": 8 }"#).unwrap();
        assert_eq!(opts.max_fixed_point_iterations, 8);
        assert_eq!(opts.max_region_growth, 1 << 20);
        assert!(opts.warn_partial_schedules);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(LowerOptions::from_json(r#"{ "max_iterations": 8 }"#).is_err());
    }

    #[test]
    fn request_builder() {
        let req = Request::new().output("out", &[(0, 16), (0, 8)]);
        assert_eq!(req.names().collect::<Vec<_>>(), vec!["out"]);
        assert_eq!(req.get("out").unwrap().region[1], (0, 8));
        assert!(req.get("tmp").is_none());
    }
}
