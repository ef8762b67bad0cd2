use serde_json::{Map, Value};
use thiserror::Error;

use crate::metrics::{Family, Phase, Registry};

/// Maps one top-level field of a status payload onto a gauge.
#[derive(Debug, Clone, Copy)]
pub struct FieldMapping {
    pub field: &'static str,
    pub family: Family,
    pub phase: Phase,
}

const fn map(field: &'static str, family: Family, phase: Phase) -> FieldMapping {
    FieldMapping {
        field,
        family,
        phase,
    }
}

/// `status.em:0`: instantaneous readings. Voltage, power factor and frequency
/// have no total across phases.
///
/// ```json
/// {"id": 0, "a_current": 1.141, "a_voltage": 229, "a_act_power": 195.9,
///  "a_aprt_power": 261.8, "a_pf": 0.75, "a_freq": 50, ...,
///  "n_current": null, "total_current": 2.192, "total_act_power": 356.235,
///  "total_aprt_power": 502.525, "user_calibrated_phase": []}
/// ```
pub const EM_FIELDS: &[FieldMapping] = &[
    map("a_current", Family::Current, Phase::A),
    map("b_current", Family::Current, Phase::B),
    map("c_current", Family::Current, Phase::C),
    map("total_current", Family::Current, Phase::Total),
    map("a_voltage", Family::Voltage, Phase::A),
    map("b_voltage", Family::Voltage, Phase::B),
    map("c_voltage", Family::Voltage, Phase::C),
    map("a_act_power", Family::ActivePower, Phase::A),
    map("b_act_power", Family::ActivePower, Phase::B),
    map("c_act_power", Family::ActivePower, Phase::C),
    map("total_act_power", Family::ActivePower, Phase::Total),
    map("a_aprt_power", Family::ApparentPower, Phase::A),
    map("b_aprt_power", Family::ApparentPower, Phase::B),
    map("c_aprt_power", Family::ApparentPower, Phase::C),
    map("total_aprt_power", Family::ApparentPower, Phase::Total),
    map("a_pf", Family::PowerFactor, Phase::A),
    map("b_pf", Family::PowerFactor, Phase::B),
    map("c_pf", Family::PowerFactor, Phase::C),
    map("a_freq", Family::Frequency, Phase::A),
    map("b_freq", Family::Frequency, Phase::B),
    map("c_freq", Family::Frequency, Phase::C),
];

/// `status.emdata:0`: cumulative energy counters in Wh.
///
/// ```json
/// {"id": 0, "a_total_act_energy": 81574.47, "a_total_act_ret_energy": 0, ...,
///  "total_act": 96916.55, "total_act_ret": 0}
/// ```
pub const EMDATA_FIELDS: &[FieldMapping] = &[
    map("a_total_act_energy", Family::TotalActiveEnergy, Phase::A),
    map("b_total_act_energy", Family::TotalActiveEnergy, Phase::B),
    map("c_total_act_energy", Family::TotalActiveEnergy, Phase::C),
    map("total_act", Family::TotalActiveEnergy, Phase::Total),
    map("a_total_act_ret_energy", Family::TotalActiveEnergyReturned, Phase::A),
    map("b_total_act_ret_energy", Family::TotalActiveEnergyReturned, Phase::B),
    map("c_total_act_ret_energy", Family::TotalActiveEnergyReturned, Phase::C),
    map("total_act_ret", Family::TotalActiveEnergyReturned, Phase::Total),
];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` is not a number")]
    NotNumeric(&'static str),
}

/// Parse a message body as a JSON object.
pub fn parse_body(body: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    match serde_json::from_slice(body)? {
        Value::Object(object) => Ok(object),
        _ => Err(DecodeError::NotAnObject),
    }
}

/// Resolve every field of `table` in `payload`. Fields outside the table,
/// null or not, are never looked at.
pub fn extract(
    payload: &Map<String, Value>,
    table: &[FieldMapping],
) -> Result<Vec<(FieldMapping, f64)>, DecodeError> {
    table
        .iter()
        .map(|mapping| match payload.get(mapping.field) {
            None | Some(Value::Null) => Err(DecodeError::MissingField(mapping.field)),
            Some(value) => value
                .as_f64()
                .map(|v| (*mapping, v))
                .ok_or(DecodeError::NotNumeric(mapping.field)),
        })
        .collect()
}

/// Decode `payload` against `table` and write the result into the registry.
///
/// All fields are resolved before anything is written, so a failed decode
/// leaves the registry untouched. Values are passed through unchanged.
pub fn apply(
    registry: &Registry,
    payload: &Map<String, Value>,
    table: &[FieldMapping],
) -> Result<usize, DecodeError> {
    let values = extract(payload, table)?;

    let mut writer = registry.write();
    for (mapping, value) in &values {
        writer.set(mapping.family, mapping.phase, *value);
    }

    Ok(values.len())
}
