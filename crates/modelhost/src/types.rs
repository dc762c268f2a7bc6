//! Inference request/response payloads (KServe v2 JSON shape).
//!
//! Tensor data is held in a typed [`TensorData`] whose variant follows the
//! tensor's [`Datatype`]. Incoming JSON is converted according to the declared
//! datatype, so an empty `[]` or an integer literal in an `FP32` tensor still
//! lands in the right variant and re-serializes to the same value.

use serde::ser::Error as _;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::PredictError;

pub type Parameters = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Datatype {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Fp16,
    Fp32,
    Fp64,
    Bytes,
}

impl Datatype {
    pub fn is_float(&self) -> bool {
        matches!(self, Datatype::Fp16 | Datatype::Fp32 | Datatype::Fp64)
    }

    pub fn is_signed_int(&self) -> bool {
        matches!(
            self,
            Datatype::Int8 | Datatype::Int16 | Datatype::Int32 | Datatype::Int64
        )
    }

    pub fn is_unsigned_int(&self) -> bool {
        matches!(
            self,
            Datatype::Uint8 | Datatype::Uint16 | Datatype::Uint32 | Datatype::Uint64
        )
    }

    /// Inclusive bounds of a signed integer tag.
    fn signed_bounds(&self) -> Option<(i64, i64)> {
        match self {
            Datatype::Int8 => Some((i8::MIN.into(), i8::MAX.into())),
            Datatype::Int16 => Some((i16::MIN.into(), i16::MAX.into())),
            Datatype::Int32 => Some((i32::MIN.into(), i32::MAX.into())),
            Datatype::Int64 => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }

    fn unsigned_max(&self) -> Option<u64> {
        match self {
            Datatype::Uint8 => Some(u8::MAX.into()),
            Datatype::Uint16 => Some(u16::MAX.into()),
            Datatype::Uint32 => Some(u32::MAX.into()),
            Datatype::Uint64 => Some(u64::MAX),
            _ => None,
        }
    }

    /// Largest finite magnitude of a float tag (65504 is the IEEE half max).
    fn float_max(&self) -> Option<f64> {
        match self {
            Datatype::Fp16 => Some(65504.0),
            Datatype::Fp32 => Some(f32::MAX.into()),
            Datatype::Fp64 => Some(f64::MAX),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.is_float() || self.is_signed_int() || self.is_unsigned_int()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Bool => "BOOL",
            Datatype::Uint8 => "UINT8",
            Datatype::Uint16 => "UINT16",
            Datatype::Uint32 => "UINT32",
            Datatype::Uint64 => "UINT64",
            Datatype::Int8 => "INT8",
            Datatype::Int16 => "INT16",
            Datatype::Int32 => "INT32",
            Datatype::Int64 => "INT64",
            Datatype::Fp16 => "FP16",
            Datatype::Fp32 => "FP32",
            Datatype::Fp64 => "FP64",
            Datatype::Bytes => "BYTES",
        }
    }
}

/// Flat, row-major tensor contents.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    UInt(Vec<u64>),
    Float(Vec<f64>),
    Bytes(Vec<String>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::Bool(v) => v.len(),
            TensorData::Int(v) => v.len(),
            TensorData::UInt(v) => v.len(),
            TensorData::Float(v) => v.len(),
            TensorData::Bytes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Datatype a tensor gets when built from this data without an explicit tag.
    pub fn natural_datatype(&self) -> Datatype {
        match self {
            TensorData::Bool(_) => Datatype::Bool,
            TensorData::Int(_) => Datatype::Int64,
            TensorData::UInt(_) => Datatype::Uint64,
            TensorData::Float(_) => Datatype::Fp64,
            TensorData::Bytes(_) => Datatype::Bytes,
        }
    }

    fn matches(&self, datatype: Datatype) -> bool {
        match self {
            TensorData::Bool(_) => datatype == Datatype::Bool,
            TensorData::Int(_) => datatype.is_signed_int(),
            TensorData::UInt(_) => datatype.is_unsigned_int(),
            TensorData::Float(_) => datatype.is_float(),
            TensorData::Bytes(_) => datatype == Datatype::Bytes,
        }
    }

    /// First element that does not fit the width of `datatype`.
    fn out_of_range(&self, datatype: Datatype) -> Option<String> {
        match self {
            TensorData::Int(v) => {
                let (min, max) = datatype.signed_bounds()?;
                v.iter().find(|x| **x < min || **x > max).map(ToString::to_string)
            }
            TensorData::UInt(v) => {
                let max = datatype.unsigned_max()?;
                v.iter().find(|x| **x > max).map(ToString::to_string)
            }
            TensorData::Float(v) => {
                let max = datatype.float_max()?;
                v.iter().find(|x| x.abs() > max).map(ToString::to_string)
            }
            TensorData::Bool(_) | TensorData::Bytes(_) => None,
        }
    }

    /// Numeric contents widened to f64. `None` for BOOL and BYTES.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        match self {
            TensorData::Int(v) => Some(v.iter().map(|x| *x as f64).collect()),
            TensorData::UInt(v) => Some(v.iter().map(|x| *x as f64).collect()),
            TensorData::Float(v) => Some(v.clone()),
            TensorData::Bool(_) | TensorData::Bytes(_) => None,
        }
    }

    /// Converts a JSON value (flat or nested array, or a scalar) into data of
    /// the given datatype.
    pub fn from_json(datatype: Datatype, value: &Value) -> Result<Self, String> {
        let mut flat = Vec::new();
        flatten(value, &mut flat);

        fn collect<T>(
            items: &[&Value],
            datatype: Datatype,
            f: impl Fn(&Value) -> Option<T>,
        ) -> Result<Vec<T>, String> {
            items
                .iter()
                .copied()
                .enumerate()
                .map(|(i, v)| {
                    f(v).ok_or_else(|| {
                        format!("element {} ({}) is not a valid {} value", i, v, datatype.as_str())
                    })
                })
                .collect()
        }

        let data = match datatype {
            Datatype::Bool => TensorData::Bool(collect(&flat, datatype, Value::as_bool)?),
            Datatype::Int8 | Datatype::Int16 | Datatype::Int32 | Datatype::Int64 => {
                TensorData::Int(collect(&flat, datatype, Value::as_i64)?)
            }
            Datatype::Uint8 | Datatype::Uint16 | Datatype::Uint32 | Datatype::Uint64 => {
                TensorData::UInt(collect(&flat, datatype, Value::as_u64)?)
            }
            Datatype::Fp16 | Datatype::Fp32 | Datatype::Fp64 => {
                TensorData::Float(collect(&flat, datatype, Value::as_f64)?)
            }
            Datatype::Bytes => TensorData::Bytes(collect(&flat, datatype, |v| {
                v.as_str().map(str::to_string)
            })?),
        };
        Ok(data)
    }
}

fn flatten<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| flatten(v, out)),
        other => out.push(other),
    }
}

impl Serialize for TensorData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TensorData::Bool(v) => v.serialize(serializer),
            TensorData::Int(v) => v.serialize(serializer),
            TensorData::UInt(v) => v.serialize(serializer),
            TensorData::Float(v) => {
                // JSON has no NaN/Infinity; serde_json would silently write null.
                if let Some(bad) = v.iter().find(|x| !x.is_finite()) {
                    return Err(S::Error::custom(format!(
                        "non-finite float {} cannot be represented in JSON",
                        bad
                    )));
                }
                v.serialize(serializer)
            }
            TensorData::Bytes(v) => v.serialize(serializer),
        }
    }
}

/// A named tensor as it appears in `inputs` / `outputs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub datatype: Datatype,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
    pub data: TensorData,
}

pub type RequestInput = NamedTensor;
pub type ResponseOutput = NamedTensor;

#[derive(Deserialize)]
struct RawTensor {
    name: String,
    shape: Vec<usize>,
    datatype: Datatype,
    #[serde(default)]
    parameters: Option<Parameters>,
    data: Value,
}

impl TryFrom<RawTensor> for NamedTensor {
    type Error = String;

    fn try_from(raw: RawTensor) -> Result<Self, Self::Error> {
        let data = TensorData::from_json(raw.datatype, &raw.data)
            .map_err(|e| format!("tensor '{}': {}", raw.name, e))?;
        Ok(NamedTensor {
            name: raw.name,
            shape: raw.shape,
            datatype: raw.datatype,
            parameters: raw.parameters,
            data,
        })
    }
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: TensorData) -> Self {
        Self {
            name: name.into(),
            shape,
            datatype: data.natural_datatype(),
            parameters: None,
            data,
        }
    }

    pub fn with_datatype(mut self, datatype: Datatype) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// `None` when the shape's product overflows `usize`.
    pub fn element_count(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
    }

    /// Checks that shape, datatype and data agree with each other.
    pub fn validate(&self) -> Result<(), PredictError> {
        if !self.data.matches(self.datatype) {
            return Err(PredictError::DatatypeMismatch(format!(
                "tensor '{}' declared {} but carries incompatible data",
                self.name,
                self.datatype.as_str()
            )));
        }
        if let Some(value) = self.data.out_of_range(self.datatype) {
            return Err(PredictError::DatatypeMismatch(format!(
                "tensor '{}' value {} does not fit {}",
                self.name,
                value,
                self.datatype.as_str()
            )));
        }
        let elements = self.element_count().ok_or_else(|| {
            PredictError::ShapeMismatch(format!(
                "tensor '{}' shape {:?} has too many elements",
                self.name, self.shape
            ))
        })?;
        if elements != self.data.len() {
            return Err(PredictError::ShapeMismatch(format!(
                "tensor '{}' has shape {:?} ({} elements) but {} data values",
                self.name,
                self.shape,
                elements,
                self.data.len()
            )));
        }
        Ok(())
    }

    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.as_ref()?.get(key)?.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
}

impl RequestOutput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
    pub inputs: Vec<RequestInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<RequestOutput>>,
}

impl InferenceRequest {
    pub fn new(inputs: Vec<RequestInput>) -> Self {
        Self {
            id: None,
            parameters: None,
            inputs,
            outputs: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_outputs(mut self, names: &[&str]) -> Self {
        self.outputs = Some(names.iter().map(|n| RequestOutput::new(*n)).collect());
        self
    }

    pub fn with_parameter(mut self, key: &str, value: Value) -> Self {
        self.parameters
            .get_or_insert_with(Parameters::new)
            .insert(key.to_string(), value);
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.as_ref()?.get(key)
    }

    /// Names of the outputs the caller asked for, if it asked.
    pub fn requested_outputs(&self) -> Option<Vec<&str>> {
        self.outputs
            .as_ref()
            .map(|outs| outs.iter().map(|o| o.name.as_str()).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
    pub outputs: Vec<ResponseOutput>,
}

impl InferenceResponse {
    pub fn output(&self, name: &str) -> Option<&ResponseOutput> {
        self.outputs.iter().find(|o| o.name == name)
    }
}

/// Signature entry for model metadata. `-1` in a shape means "any size".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorMetadata {
    pub name: String,
    pub datatype: Datatype,
    pub shape: Vec<i64>,
}

impl TensorMetadata {
    pub fn new(name: impl Into<String>, datatype: Datatype, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            datatype,
            shape,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataModelResponse {
    pub name: String,
    pub versions: Vec<String>,
    pub platform: String,
    pub inputs: Vec<TensorMetadata>,
    pub outputs: Vec<TensorMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_field_names() {
        let request = InferenceRequest::new(vec![NamedTensor::new(
            "input-0",
            vec![1, 2],
            TensorData::Float(vec![0.5, 1.5]),
        )
        .with_datatype(Datatype::Fp32)])
        .with_id("req-1");

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "req-1",
                "inputs": [{"name": "input-0", "shape": [1, 2], "datatype": "FP32", "data": [0.5, 1.5]}]
            })
        );
    }

    #[test]
    fn test_datatype_drives_decoding() {
        let json = r#"{"inputs": [
            {"name": "a", "shape": [2], "datatype": "FP64", "data": [1, 2]},
            {"name": "b", "shape": [0], "datatype": "INT32", "data": []},
            {"name": "c", "shape": [2, 2], "datatype": "UINT8", "data": [[1, 2], [3, 4]]},
            {"name": "d", "shape": [1], "datatype": "BYTES", "data": ["hello"]}
        ]}"#;
        let request: InferenceRequest = serde_json::from_str(json).unwrap();

        assert_eq!(request.inputs[0].data, TensorData::Float(vec![1.0, 2.0]));
        assert_eq!(request.inputs[1].data, TensorData::Int(vec![]));
        assert_eq!(request.inputs[2].data, TensorData::UInt(vec![1, 2, 3, 4]));
        assert_eq!(request.inputs[3].data, TensorData::Bytes(vec!["hello".into()]));
    }

    #[test]
    fn test_decoding_rejects_wrong_element_type() {
        let json = r#"{"inputs": [{"name": "a", "shape": [1], "datatype": "BOOL", "data": ["yes"]}]}"#;
        let err = serde_json::from_str::<InferenceRequest>(json).unwrap_err();
        assert!(err.to_string().contains("tensor 'a'"));
    }

    #[test]
    fn test_request_roundtrip_preserves_empty_and_typed_data() {
        let request = InferenceRequest::new(vec![
            NamedTensor::new("empty", vec![0], TensorData::Int(vec![])).with_datatype(Datatype::Int16),
            NamedTensor::new("flags", vec![2], TensorData::Bool(vec![true, false])),
        ])
        .with_outputs(&["predict"])
        .with_parameter("content_type", json!("np"));

        let text = serde_json::to_string(&request).unwrap();
        let back: InferenceRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_validate_shape_and_datatype() {
        let ok = NamedTensor::new("x", vec![2, 2], TensorData::Float(vec![0.0; 4]));
        assert!(ok.validate().is_ok());

        let bad_shape = NamedTensor::new("x", vec![3], TensorData::Float(vec![0.0; 4]));
        assert!(matches!(bad_shape.validate(), Err(PredictError::ShapeMismatch(_))));

        let bad_type =
            NamedTensor::new("x", vec![1], TensorData::Float(vec![0.0])).with_datatype(Datatype::Bytes);
        assert!(matches!(bad_type.validate(), Err(PredictError::DatatypeMismatch(_))));
    }

    #[test]
    fn test_validate_rejects_overflowing_shape() {
        let json = r#"{"name": "x", "shape": [9223372036854775808, 2], "datatype": "FP64", "data": []}"#;
        let tensor: NamedTensor = serde_json::from_str(json).unwrap();
        assert_eq!(tensor.element_count(), None);
        assert!(matches!(tensor.validate(), Err(PredictError::ShapeMismatch(_))));
    }

    #[test]
    fn test_validate_rejects_values_wider_than_datatype() {
        let int8: NamedTensor = serde_json::from_str(
            r#"{"name": "x", "shape": [2], "datatype": "INT8", "data": [1000, -5000]}"#,
        )
        .unwrap();
        assert!(matches!(int8.validate(), Err(PredictError::DatatypeMismatch(_))));

        let uint16 = NamedTensor::new("x", vec![1], TensorData::UInt(vec![70_000]))
            .with_datatype(Datatype::Uint16);
        assert!(matches!(uint16.validate(), Err(PredictError::DatatypeMismatch(_))));

        let fp32 = NamedTensor::new("x", vec![1], TensorData::Float(vec![1e300]))
            .with_datatype(Datatype::Fp32);
        assert!(matches!(fp32.validate(), Err(PredictError::DatatypeMismatch(_))));

        let edges = NamedTensor::new("x", vec![2], TensorData::Int(vec![-128, 127]))
            .with_datatype(Datatype::Int8);
        assert!(edges.validate().is_ok());
    }

    #[test]
    fn test_non_finite_float_refuses_to_serialize() {
        let tensor = NamedTensor::new("x", vec![1], TensorData::Float(vec![f64::NAN]));
        assert!(serde_json::to_string(&tensor).is_err());
    }

    #[test]
    fn test_response_omits_absent_optionals() {
        let response = InferenceResponse {
            model_name: "clf".into(),
            model_version: None,
            id: None,
            parameters: None,
            outputs: vec![],
        };
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"model_name":"clf","outputs":[]}"#
        );
    }
}
