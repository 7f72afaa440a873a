use crate::error::CoordError;
use crate::tso::Timestamp;
use serde::{Deserialize, Serialize};

/// Argument type tag of a user-defined function signature.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float => "float",
            DataType::Double => "double",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DataType {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bool" => Ok(DataType::Bool),
            "int8" => Ok(DataType::Int8),
            "int16" => Ok(DataType::Int16),
            "int32" => Ok(DataType::Int32),
            "int64" => Ok(DataType::Int64),
            "float" => Ok(DataType::Float),
            "double" => Ok(DataType::Double),
            other => Err(CoordError::Validation(format!("unknown data type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Bool,
            Value::Int8(_) => DataType::Int8,
            Value::Int16(_) => DataType::Int16,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::Float(_) => DataType::Float,
            Value::Double(_) => DataType::Double,
        }
    }

    /// Parses a textual argument as the given type.
    pub fn parse_as(data_type: DataType, raw: &str) -> Result<Self, CoordError> {
        let raw = raw.trim();
        let bad = |e: &dyn std::fmt::Display| {
            CoordError::Validation(format!("cannot parse '{raw}' as {data_type}: {e}"))
        };
        Ok(match data_type {
            DataType::Bool => Value::Bool(raw.parse().map_err(|e| bad(&e))?),
            DataType::Int8 => Value::Int8(raw.parse().map_err(|e| bad(&e))?),
            DataType::Int16 => Value::Int16(raw.parse().map_err(|e| bad(&e))?),
            DataType::Int32 => Value::Int32(raw.parse().map_err(|e| bad(&e))?),
            DataType::Int64 => Value::Int64(raw.parse().map_err(|e| bad(&e))?),
            DataType::Float => Value::Float(raw.parse().map_err(|e| bad(&e))?),
            DataType::Double => Value::Double(raw.parse().map_err(|e| bad(&e))?),
        })
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int8(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
        }
    }
}

/// A committed user-defined function. Shared read-only once registered; a
/// redefinition goes through drop and create.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub binary: Vec<u8>,
    pub arg_types: Vec<DataType>,
    pub registered_at: Timestamp,
}

/// Checks supplied arguments against a declared signature.
pub fn check_arguments(
    function: &str,
    expected: &[DataType],
    args: &[Value],
) -> Result<(), CoordError> {
    let matches = expected.len() == args.len()
        && expected
            .iter()
            .zip(args)
            .all(|(declared, arg)| *declared == arg.data_type());
    if matches {
        return Ok(());
    }
    Err(CoordError::ArgumentTypeMismatch {
        function: function.to_string(),
        expected: expected.to_vec(),
        actual: args.iter().map(Value::data_type).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::{DataType, Value, check_arguments};
    use proptest::prelude::*;

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i8>().prop_map(Value::Int8),
            any::<i16>().prop_map(Value::Int16),
            any::<i32>().prop_map(Value::Int32),
            any::<i64>().prop_map(Value::Int64),
            any::<f32>()
                .prop_filter("finite float only", |v| v.is_finite())
                .prop_map(Value::Float),
            any::<f64>()
                .prop_filter("finite float only", |v| v.is_finite())
                .prop_map(Value::Double),
        ]
    }

    proptest! {
        #[test]
        fn display_then_parse_preserves_value(v in arb_value()) {
            let parsed = Value::parse_as(v.data_type(), &v.to_string())
                .expect("displayed value should parse back");
            prop_assert_eq!(parsed, v);
        }

        #[test]
        fn matching_signature_is_accepted(values in prop::collection::vec(arb_value(), 0..8)) {
            let signature: Vec<DataType> = values.iter().map(Value::data_type).collect();
            prop_assert!(check_arguments("f", &signature, &values).is_ok());
        }
    }

    #[test]
    fn mismatch_reports_both_signatures() {
        let err = check_arguments(
            "add_one",
            &[DataType::Int32],
            &[Value::Int64(5)],
        )
        .expect_err("int64 is not int32");
        assert_eq!(err.code_str(), "argument_type_mismatch");

        let err = check_arguments("add_one", &[DataType::Int32], &[])
            .expect_err("arity mismatch");
        match err {
            crate::error::CoordError::ArgumentTypeMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, vec![DataType::Int32]);
                assert!(actual.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn data_type_names_parse() {
        for dt in [
            DataType::Bool,
            DataType::Int8,
            DataType::Int16,
            DataType::Int32,
            DataType::Int64,
            DataType::Float,
            DataType::Double,
        ] {
            assert_eq!(dt.as_str().parse::<DataType>().expect("parse"), dt);
        }
        assert!("varchar".parse::<DataType>().is_err());
    }
}
