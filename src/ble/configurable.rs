//! JSON-configured layout parser
//!
//! For simple unencrypted sensors a full parser implementation is
//! overkill: a JSON document describing field offsets, widths, scales,
//! and an optional transform formula is enough. Formulas are evaluated by
//! a small shunting-yard interpreter over `[0-9+-*/().x]` - no runtime
//! code generation.

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use super::{ParseError, ParseOptions, SensorParser};
use crate::types::SensorRecord;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("layout has no fields")]
    Empty,

    #[error("field {field}: {message}")]
    BadField { field: String, message: String },

    #[error("formula for {field}: {message}")]
    BadFormula { field: String, message: String },
}

/// How a field's raw little-endian bytes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Uint,
    Int,
    Bool,
}

/// One field of a configured layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub name: String,
    /// Byte offset into the manufacturer-data payload.
    pub offset: usize,
    /// Field width in bytes (1..=8), little-endian.
    pub length: usize,
    #[serde(default, rename = "type")]
    pub kind: FieldKind,
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Formula over `x` (the scaled value), e.g. `"(x - 32) * 5 / 9"`.
    #[serde(default)]
    pub transform: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

fn default_scale() -> f64 {
    1.0
}

/// A full device layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutSpec {
    pub manufacturer_id: u16,
    pub model: String,
    pub fields: Vec<FieldSpec>,
}

/// Parser driven by a [`LayoutSpec`]. Transforms are compiled once at
/// construction so a bad formula surfaces at startup, not per frame.
pub struct ConfigurableParser {
    spec: LayoutSpec,
    transforms: Vec<Option<Expr>>,
    min_length: usize,
}

impl ConfigurableParser {
    pub fn from_spec(spec: LayoutSpec) -> Result<Self, LayoutError> {
        if spec.fields.is_empty() {
            return Err(LayoutError::Empty);
        }
        let mut transforms = Vec::with_capacity(spec.fields.len());
        let mut min_length = 0usize;
        for field in &spec.fields {
            if field.length == 0 || field.length > 8 {
                return Err(LayoutError::BadField {
                    field: field.name.clone(),
                    message: format!("length {} out of range 1..=8", field.length),
                });
            }
            min_length = min_length.max(field.offset + field.length);
            let compiled = match &field.transform {
                Some(formula) => Some(Expr::compile(formula).map_err(|message| {
                    LayoutError::BadFormula {
                        field: field.name.clone(),
                        message,
                    }
                })?),
                None => None,
            };
            transforms.push(compiled);
        }
        Ok(Self {
            spec,
            transforms,
            min_length,
        })
    }

    pub fn from_json(raw: &Value) -> Result<Self, LayoutError> {
        let spec: LayoutSpec =
            serde_json::from_value(raw.clone()).map_err(|e| LayoutError::BadField {
                field: "<layout>".to_string(),
                message: e.to_string(),
            })?;
        Self::from_spec(spec)
    }
}

impl SensorParser for ConfigurableParser {
    fn manufacturer_id(&self) -> u16 {
        self.spec.manufacturer_id
    }

    fn matches(&self, data: &[u8]) -> bool {
        data.len() >= self.min_length
            && super::manufacturer_id(data) == Some(self.spec.manufacturer_id)
    }

    fn parse(
        &self,
        data: &[u8],
        _opts: &ParseOptions,
    ) -> Result<Option<SensorRecord>, ParseError> {
        if data.len() < self.min_length {
            return Err(ParseError::TooShort {
                needed: self.min_length,
                got: data.len(),
            });
        }

        let mut fields = serde_json::Map::new();
        for (field, transform) in self.spec.fields.iter().zip(&self.transforms) {
            let bytes = &data[field.offset..field.offset + field.length];
            let mut raw: u64 = 0;
            for (i, byte) in bytes.iter().enumerate() {
                raw |= u64::from(*byte) << (8 * i);
            }

            let value = match field.kind {
                FieldKind::Bool => json!(raw != 0),
                FieldKind::Uint | FieldKind::Int => {
                    let numeric = if field.kind == FieldKind::Int {
                        sign_extend(raw, field.length) as f64
                    } else {
                        raw as f64
                    };
                    let mut scaled = numeric * field.scale;
                    if let Some(expr) = transform {
                        scaled = expr.eval(scaled);
                    }
                    json!(scaled)
                }
            };
            let entry = match &field.unit {
                Some(unit) => json!({ "value": value, "unit": unit }),
                None => value,
            };
            fields.insert(field.name.clone(), entry);
        }

        Ok(Some(SensorRecord::Generic {
            model: self.spec.model.clone(),
            fields,
        }))
    }
}

fn sign_extend(raw: u64, bytes: usize) -> i64 {
    let bits = bytes as u32 * 8;
    if bits >= 64 {
        return raw as i64;
    }
    let sign = 1u64 << (bits - 1);
    if raw & sign != 0 {
        (raw | !((1u64 << bits) - 1)) as i64
    } else {
        raw as i64
    }
}

// ============================================================================
// Expression Evaluator
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Variable,
    Plus,
    Minus,
    Star,
    Slash,
    Open,
    Close,
}

/// Compiled RPN form of a transform formula.
#[derive(Debug, Clone)]
pub struct Expr {
    rpn: Vec<Token>,
}

impl Expr {
    /// Shunting-yard compile. Only `[0-9+-*/().x]` and whitespace are
    /// accepted; anything else is a compile error.
    pub fn compile(formula: &str) -> Result<Self, String> {
        let tokens = tokenize(formula)?;
        if tokens.is_empty() {
            return Err("empty formula".to_string());
        }

        let mut output = Vec::new();
        let mut ops: Vec<Token> = Vec::new();
        for token in tokens {
            match token {
                Token::Number(_) | Token::Variable => output.push(token),
                Token::Plus | Token::Minus | Token::Star | Token::Slash => {
                    while let Some(top) = ops.last() {
                        if *top != Token::Open && precedence(*top) >= precedence(token) {
                            output.push(ops.pop().ok_or("operator stack underflow")?);
                        } else {
                            break;
                        }
                    }
                    ops.push(token);
                }
                Token::Open => ops.push(token),
                Token::Close => loop {
                    match ops.pop() {
                        Some(Token::Open) => break,
                        Some(op) => output.push(op),
                        None => return Err("unbalanced parentheses".to_string()),
                    }
                },
            }
        }
        while let Some(op) = ops.pop() {
            if op == Token::Open {
                return Err("unbalanced parentheses".to_string());
            }
            output.push(op);
        }

        // Validate arity with a dry run so eval can stay infallible.
        let expr = Self { rpn: output };
        expr.try_eval(0.0)?;
        Ok(expr)
    }

    fn try_eval(&self, x: f64) -> Result<f64, String> {
        let mut stack: Vec<f64> = Vec::new();
        for token in &self.rpn {
            match token {
                Token::Number(n) => stack.push(*n),
                Token::Variable => stack.push(x),
                op => {
                    let b = stack.pop().ok_or("missing operand")?;
                    let a = stack.pop().ok_or("missing operand")?;
                    stack.push(match op {
                        Token::Plus => a + b,
                        Token::Minus => a - b,
                        Token::Star => a * b,
                        Token::Slash => a / b,
                        _ => return Err("unexpected token".to_string()),
                    });
                }
            }
        }
        match stack.as_slice() {
            [result] => Ok(*result),
            _ => Err("dangling operands".to_string()),
        }
    }

    /// Evaluate with `x` bound. Compiled expressions cannot fail.
    pub fn eval(&self, x: f64) -> f64 {
        self.try_eval(x).unwrap_or(f64::NAN)
    }
}

fn precedence(op: Token) -> u8 {
    match op {
        Token::Star | Token::Slash => 2,
        _ => 1,
    }
}

fn tokenize(formula: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = formula.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            'x' => {
                chars.next();
                tokens.push(Token::Variable);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                // Unary minus: rewrite as (0 - expr) operand.
                if matches!(
                    tokens.last(),
                    None | Some(Token::Open | Token::Plus | Token::Minus | Token::Star | Token::Slash)
                ) {
                    tokens.push(Token::Number(0.0));
                }
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '0'..='9' | '.' => {
                let mut literal = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        literal.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number: f64 = literal
                    .parse()
                    .map_err(|_| format!("bad number literal: {literal}"))?;
                tokens.push(Token::Number(number));
            }
            other => return Err(format!("illegal character in formula: {other:?}")),
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thermometer_layout() -> Value {
        json!({
            "manufacturerId": 0x0499,
            "model": "ruuvi-lite",
            "fields": [
                { "name": "temperature", "offset": 2, "length": 2, "type": "int",
                  "scale": 0.005, "unit": "C" },
                { "name": "humidity", "offset": 4, "length": 2, "type": "uint",
                  "scale": 0.0025 },
                { "name": "charging", "offset": 6, "length": 1, "type": "bool" }
            ]
        })
    }

    #[test]
    fn test_layout_parse() {
        let parser = ConfigurableParser::from_json(&thermometer_layout()).unwrap();
        // mfr 0x0499 LE, temp = 4400 (22.0 C), humidity = 10000 (25 %), charging.
        let data = [0x99, 0x04, 0x30, 0x11, 0x10, 0x27, 0x01];
        assert!(parser.matches(&data));

        let record = parser.parse(&data, &ParseOptions::default()).unwrap().unwrap();
        let SensorRecord::Generic { model, fields } = record else {
            panic!("expected generic record");
        };
        assert_eq!(model, "ruuvi-lite");
        assert_eq!(fields["temperature"]["value"], json!(22.0));
        assert_eq!(fields["temperature"]["unit"], json!("C"));
        assert_eq!(fields["humidity"], json!(25.0));
        assert_eq!(fields["charging"], json!(true));
    }

    #[test]
    fn test_signed_field() {
        let layout = json!({
            "manufacturerId": 1,
            "model": "m",
            "fields": [
                { "name": "t", "offset": 2, "length": 2, "type": "int", "scale": 0.01 }
            ]
        });
        let parser = ConfigurableParser::from_json(&layout).unwrap();
        // -100 as i16 LE = 0x9c 0xff -> -1.0 after scaling.
        let data = [0x01, 0x00, 0x9c, 0xff];
        let SensorRecord::Generic { fields, .. } =
            parser.parse(&data, &ParseOptions::default()).unwrap().unwrap()
        else {
            panic!()
        };
        assert_eq!(fields["t"], json!(-1.0));
    }

    #[test]
    fn test_transform_formula() {
        let layout = json!({
            "manufacturerId": 1,
            "model": "m",
            "fields": [
                { "name": "temp_c", "offset": 2, "length": 1,
                  "transform": "(x - 32) * 5 / 9" }
            ]
        });
        let parser = ConfigurableParser::from_json(&layout).unwrap();
        let data = [0x01, 0x00, 212];
        let SensorRecord::Generic { fields, .. } =
            parser.parse(&data, &ParseOptions::default()).unwrap().unwrap()
        else {
            panic!()
        };
        assert_eq!(fields["temp_c"], json!(100.0));
    }

    #[test]
    fn test_short_frame_errors() {
        let parser = ConfigurableParser::from_json(&thermometer_layout()).unwrap();
        assert!(matches!(
            parser.parse(&[0x99, 0x04], &ParseOptions::default()),
            Err(ParseError::TooShort { .. })
        ));
    }

    #[test]
    fn test_bad_formula_rejected_at_compile() {
        let layout = json!({
            "manufacturerId": 1,
            "model": "m",
            "fields": [
                { "name": "f", "offset": 0, "length": 1, "transform": "x ** 2" }
            ]
        });
        assert!(matches!(
            ConfigurableParser::from_json(&layout),
            Err(LayoutError::BadFormula { .. })
        ));

        let injection = json!({
            "manufacturerId": 1,
            "model": "m",
            "fields": [
                { "name": "f", "offset": 0, "length": 1, "transform": "x; exec()" }
            ]
        });
        assert!(ConfigurableParser::from_json(&injection).is_err());
    }

    #[test]
    fn test_expr_precedence_and_unary_minus() {
        assert_eq!(Expr::compile("2 + 3 * 4").unwrap().eval(0.0), 14.0);
        assert_eq!(Expr::compile("(2 + 3) * 4").unwrap().eval(0.0), 20.0);
        assert_eq!(Expr::compile("-x + 1").unwrap().eval(2.0), -1.0);
        assert_eq!(Expr::compile("x / 10").unwrap().eval(55.0), 5.5);
    }

    #[test]
    fn test_expr_rejects_unbalanced() {
        assert!(Expr::compile("(x + 1").is_err());
        assert!(Expr::compile("x + ").is_err());
        assert!(Expr::compile("").is_err());
    }
}
