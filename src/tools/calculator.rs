//! Scientific calculator: arithmetic, trig, hyperbolic, logarithmic and
//! statistical functions over `evalexpr`. Used as a worked `ToolRunner`
//! example and exercised by this crate's own integration tests — external
//! tool implementations are otherwise out of scope for this crate.
//!
//! All trigonometric functions operate in radians. Supports `+ - * / ^ %`,
//! `sqrt abs floor ceil round min max`, the trig/hyperbolic families and
//! their inverses, `ln log log2 exp`, the constants `pi`/`e`, and array
//! statistics (`mean median mode std stdpop var varpop sum count min max`)
//! over `[1, 2, 3]`-style literals.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use async_trait::async_trait;
use evalexpr::ContextWithMutableVariables;
use serde_json::Value;

use crate::cancel::CancellationToken;
use crate::interfaces::{RunnerError, RunnerOutput, ToolRunner};

#[derive(Debug, Clone)]
pub struct CalculatorError {
    message: String,
}

impl CalculatorError {
    pub fn new(message: impl Into<String>) -> Self {
        CalculatorError {
            message: message.into(),
        }
    }
}

impl fmt::Display for CalculatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Calculator error: {}", self.message)
    }
}

impl Error for CalculatorError {}

pub type CalculatorResult = Result<f64, CalculatorError>;

/// Stateless, cheaply cloned, safe to share across tasks.
#[derive(Clone, Default)]
pub struct Calculator {}

impl Calculator {
    pub fn new() -> Self {
        Calculator {}
    }

    pub async fn evaluate(&self, expression: &str) -> CalculatorResult {
        let expression = expression.trim();

        if let Ok(result) = self.try_statistical_function(expression) {
            return Ok(result);
        }

        self.evaluate_math_expression(expression)
    }

    fn evaluate_math_expression(&self, expression: &str) -> CalculatorResult {
        let expr = self.prepare_expression(expression)?;

        let mut context: evalexpr::HashMapContext = evalexpr::HashMapContext::new();
        let _ = context.set_value(
            "math::PI".to_string(),
            evalexpr::Value::Float(std::f64::consts::PI),
        );
        let _ = context.set_value(
            "math::E".to_string(),
            evalexpr::Value::Float(std::f64::consts::E),
        );

        match evalexpr::eval_with_context(&expr, &context) {
            Ok(value) => match value.as_number() {
                Ok(n) => Ok(n),
                Err(_) => Err(CalculatorError::new("Result is not a number")),
            },
            Err(e) => Err(CalculatorError::new(format!("Evaluation error: {}", e))),
        }
    }

    fn prepare_expression(&self, expr: &str) -> Result<String, CalculatorError> {
        let expr = expr.trim();
        let mut prepared = expr.to_string();

        prepared = prepared.replace("arcsin", "asin");
        prepared = prepared.replace("arccos", "acos");
        prepared = prepared.replace("arctan", "atan");
        prepared = prepared.replace("arcsinh", "asinh");
        prepared = prepared.replace("arccosh", "acosh");
        prepared = prepared.replace("arctanh", "atanh");
        prepared = prepared.replace("cosec", "csc");

        // log(x) / log2(x) mean base-10 / base-2; rewrite before function
        // conversion so `ln` picks up the rewritten form.
        prepared = self.replace_log_base10_evalexpr(&prepared);
        prepared = self.replace_log_base2_evalexpr(&prepared);

        prepared = self.rewrite_function(&prepared, "csc", "1/math::sin");
        prepared = self.rewrite_function(&prepared, "sec", "1/math::cos");
        prepared = self.rewrite_function(&prepared, "cot", "1/math::tan");
        prepared = self.rewrite_function(&prepared, "csch", "1/math::sinh");
        prepared = self.rewrite_function(&prepared, "sech", "1/math::cosh");
        prepared = self.rewrite_function(&prepared, "coth", "1/math::tanh");

        prepared = self.convert_to_evalexpr_functions(&prepared);
        prepared = prepared.replace("**", "^");

        prepared = self.replace_constant(&prepared, "pi", "math::PI");
        prepared = self.replace_constant(&prepared, "e", "math::E");

        Ok(prepared)
    }

    fn replace_constant(&self, expr: &str, constant: &str, replacement: &str) -> String {
        let mut result = String::new();
        let chars: Vec<char> = expr.chars().collect();
        let constant_chars: Vec<char> = constant.chars().collect();
        let constant_len = constant_chars.len();

        let mut i = 0;
        while i < chars.len() {
            if i + constant_len <= chars.len() {
                let substring: String = chars[i..i + constant_len].iter().collect();
                if substring == constant {
                    let is_word_char_before = i > 0 && chars[i - 1].is_alphanumeric();
                    let is_word_char_after =
                        i + constant_len < chars.len() && chars[i + constant_len].is_alphanumeric();

                    if !is_word_char_before && !is_word_char_after {
                        result.push_str(replacement);
                        i += constant_len;
                        continue;
                    }
                }
            }
            result.push(chars[i]);
            i += 1;
        }

        result
    }

    fn convert_to_evalexpr_functions(&self, expr: &str) -> String {
        // Longest names first to avoid e.g. converting "sin" inside "asin(".
        // evalexpr supports sin/cos/tan/sinh/cosh/tanh/asin/acos/atan/atan2/
        // sqrt/ln/exp but not floor/ceil/round/trunc/cbrt/log10/min/max/hypot/pow.
        let functions = vec![
            ("atan2", "math::atan2"),
            ("sinh", "math::sinh"),
            ("cosh", "math::cosh"),
            ("tanh", "math::tanh"),
            ("asin", "math::asin"),
            ("acos", "math::acos"),
            ("atan", "math::atan"),
            ("sqrt", "math::sqrt"),
            ("abs", "math::abs"),
            ("ln", "math::ln"),
            ("exp", "math::exp"),
            ("sin", "math::sin"),
            ("cos", "math::cos"),
            ("tan", "math::tan"),
        ];

        let mut result = expr.to_string();
        for (func_name, math_func) in functions {
            let mut i = 0;
            let mut new_result = String::new();
            let chars: Vec<char> = result.chars().collect();

            while i < chars.len() {
                if i + func_name.len() <= chars.len() {
                    let substring: String = chars[i..i + func_name.len()].iter().collect();
                    if substring == func_name {
                        let is_already_prefixed = if i >= 6 {
                            chars[i - 6..i].iter().collect::<String>() == "math::"
                        } else {
                            false
                        };

                        if !is_already_prefixed {
                            let is_word_boundary_before = i == 0 || !chars[i - 1].is_alphanumeric();

                            let mut j = i + func_name.len();
                            while j < chars.len() && chars[j].is_whitespace() {
                                j += 1;
                            }

                            if is_word_boundary_before && j < chars.len() && chars[j] == '(' {
                                new_result.push_str(math_func);
                                i += func_name.len();
                                continue;
                            }
                        }
                    }
                }
                new_result.push(chars[i]);
                i += 1;
            }

            result = new_result;
        }

        result
    }

    fn rewrite_function(&self, expr: &str, func_name: &str, replacement: &str) -> String {
        let pattern = format!("{}(", func_name);
        if !expr.contains(&pattern) {
            return expr.to_string();
        }

        let mut result = String::new();
        let mut chars = expr.chars().peekable();
        let search_bytes = pattern.as_bytes();

        while let Some(ch) = chars.next() {
            if ch == search_bytes[0] as char {
                let mut match_str = ch.to_string();
                let mut temp_chars = chars.clone();

                let mut matched = true;
                for &byte in &search_bytes[1..] {
                    if let Some(next_ch) = temp_chars.next() {
                        match_str.push(next_ch);
                        if next_ch as u8 != byte {
                            matched = false;
                            break;
                        }
                    } else {
                        matched = false;
                        break;
                    }
                }

                if matched {
                    result.push_str(replacement);
                    result.push('(');
                    for _ in 1..search_bytes.len() {
                        chars.next();
                    }
                } else {
                    result.push(ch);
                }
            } else {
                result.push(ch);
            }
        }

        result
    }

    fn replace_log_base10_evalexpr(&self, expr: &str) -> String {
        if !expr.contains("log(") {
            return expr.to_string();
        }

        let mut result = String::new();
        let mut chars = expr.chars().peekable();
        let ln_10 = "math::ln(10)";

        while let Some(ch) = chars.next() {
            if ch == 'l' {
                let mut temp_chars = chars.clone();
                let is_log = temp_chars.next() == Some('o')
                    && temp_chars.next() == Some('g')
                    && temp_chars.next() == Some('(');

                if is_log && !expr[result.len()..].starts_with("log2(") {
                    chars.next();
                    chars.next();
                    chars.next();

                    let mut paren_count = 1;
                    let mut arg = String::new();

                    while paren_count > 0 {
                        if let Some(c) = chars.next() {
                            if c == '(' {
                                paren_count += 1;
                                arg.push(c);
                            } else if c == ')' {
                                paren_count -= 1;
                                if paren_count > 0 {
                                    arg.push(c);
                                }
                            } else {
                                arg.push(c);
                            }
                        } else {
                            break;
                        }
                    }

                    result.push_str("math::ln(");
                    result.push_str(&arg);
                    result.push_str(")/");
                    result.push_str(ln_10);
                } else {
                    result.push(ch);
                }
            } else {
                result.push(ch);
            }
        }

        result
    }

    fn replace_log_base2_evalexpr(&self, expr: &str) -> String {
        if !expr.contains("log2(") {
            return expr.to_string();
        }

        let mut result = String::new();
        let mut chars = expr.chars().peekable();
        let ln_2 = "math::ln(2)";

        while let Some(ch) = chars.next() {
            if ch == 'l' {
                let mut temp_chars = chars.clone();
                if temp_chars.next() == Some('o')
                    && temp_chars.next() == Some('g')
                    && temp_chars.next() == Some('2')
                    && temp_chars.next() == Some('(')
                {
                    chars.next();
                    chars.next();
                    chars.next();
                    chars.next();

                    let mut paren_count = 1;
                    let mut arg = String::new();

                    while paren_count > 0 {
                        if let Some(c) = chars.next() {
                            if c == '(' {
                                paren_count += 1;
                                arg.push(c);
                            } else if c == ')' {
                                paren_count -= 1;
                                if paren_count > 0 {
                                    arg.push(c);
                                }
                            } else {
                                arg.push(c);
                            }
                        } else {
                            break;
                        }
                    }

                    result.push_str("math::ln(");
                    result.push_str(&arg);
                    result.push_str(")/");
                    result.push_str(ln_2);
                } else {
                    result.push(ch);
                }
            } else {
                result.push(ch);
            }
        }

        result
    }

    fn try_statistical_function(&self, expression: &str) -> CalculatorResult {
        let expr = expression.trim();

        if !expr.contains('[') && !expr.contains('(') {
            return Err(CalculatorError::new("Not a statistical function"));
        }

        if let Some(paren_idx) = expr.find('(') {
            let func_name = expr[..paren_idx].trim().to_lowercase();
            let args_start = paren_idx + 1;
            let args_end = expr
                .rfind(')')
                .ok_or_else(|| CalculatorError::new("Missing closing parenthesis"))?;
            let args = expr[args_start..args_end].trim();

            return match func_name.as_str() {
                "mean" => self.stat_mean(args),
                "median" => self.stat_median(args),
                "mode" => self.stat_mode(args),
                "std" => self.stat_std(args),
                "stdpop" => self.stat_stdpop(args),
                "var" => self.stat_var(args),
                "varpop" => self.stat_varpop(args),
                "sum" => self.stat_sum(args),
                "count" => self.stat_count(args),
                "min" => self.stat_min(args),
                "max" => self.stat_max(args),
                _ => Err(CalculatorError::new("Not a known statistical function")),
            };
        }

        Err(CalculatorError::new("Not a statistical function"))
    }

    fn parse_array(&self, arg: &str) -> Result<Vec<f64>, CalculatorError> {
        let arg = arg.trim();

        let content = if (arg.starts_with('[') && arg.ends_with(']'))
            || (arg.starts_with('(') && arg.ends_with(')'))
        {
            &arg[1..arg.len() - 1]
        } else {
            arg
        };

        if content.trim().is_empty() {
            return Err(CalculatorError::new("Empty array"));
        }

        content
            .split(',')
            .map(|s| {
                let s = s.trim();
                s.parse::<f64>()
                    .map_err(|_| CalculatorError::new(format!("Invalid number in array: {}", s)))
            })
            .collect()
    }

    fn stat_mean(&self, arg: &str) -> CalculatorResult {
        let values = self.parse_array(arg)?;
        let sum: f64 = values.iter().sum();
        Ok(sum / values.len() as f64)
    }

    fn stat_median(&self, arg: &str) -> CalculatorResult {
        let mut values = self.parse_array(arg)?;
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let n = values.len();
        if n % 2 == 1 {
            Ok(values[n / 2])
        } else {
            Ok((values[n / 2 - 1] + values[n / 2]) / 2.0)
        }
    }

    fn stat_mode(&self, arg: &str) -> CalculatorResult {
        let values = self.parse_array(arg)?;
        let mut frequencies: HashMap<String, usize> = HashMap::new();

        for v in &values {
            let key = v.to_string();
            *frequencies.entry(key).or_insert(0) += 1;
        }

        let (mode_str, _) = frequencies
            .iter()
            .max_by_key(|&(_, count)| count)
            .ok_or_else(|| CalculatorError::new("Empty array"))?;

        mode_str
            .parse::<f64>()
            .map_err(|_| CalculatorError::new("Could not parse mode value"))
    }

    fn stat_std(&self, arg: &str) -> CalculatorResult {
        let values = self.parse_array(arg)?;

        if values.len() < 2 {
            return Err(CalculatorError::new(
                "Standard deviation requires at least 2 values",
            ));
        }

        let mean: f64 = values.iter().sum::<f64>() / values.len() as f64;
        let variance: f64 =
            values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;

        Ok(variance.sqrt())
    }

    fn stat_stdpop(&self, arg: &str) -> CalculatorResult {
        let values = self.parse_array(arg)?;

        if values.is_empty() {
            return Err(CalculatorError::new("Empty array"));
        }

        let mean: f64 = values.iter().sum::<f64>() / values.len() as f64;
        let variance: f64 =
            values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / values.len() as f64;

        Ok(variance.sqrt())
    }

    fn stat_var(&self, arg: &str) -> CalculatorResult {
        let values = self.parse_array(arg)?;

        if values.len() < 2 {
            return Err(CalculatorError::new("Variance requires at least 2 values"));
        }

        let mean: f64 = values.iter().sum::<f64>() / values.len() as f64;
        let variance: f64 =
            values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;

        Ok(variance)
    }

    fn stat_varpop(&self, arg: &str) -> CalculatorResult {
        let values = self.parse_array(arg)?;

        if values.is_empty() {
            return Err(CalculatorError::new("Empty array"));
        }

        let mean: f64 = values.iter().sum::<f64>() / values.len() as f64;
        let variance: f64 =
            values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / values.len() as f64;

        Ok(variance)
    }

    fn stat_sum(&self, arg: &str) -> CalculatorResult {
        let values = self.parse_array(arg)?;
        Ok(values.iter().sum())
    }

    fn stat_count(&self, arg: &str) -> CalculatorResult {
        let values = self.parse_array(arg)?;
        Ok(values.len() as f64)
    }

    fn stat_min(&self, arg: &str) -> CalculatorResult {
        let values = self.parse_array(arg)?;
        Ok(values.iter().copied().fold(f64::INFINITY, f64::min))
    }

    fn stat_max(&self, arg: &str) -> CalculatorResult {
        let values = self.parse_array(arg)?;
        Ok(values.iter().copied().fold(f64::NEG_INFINITY, f64::max))
    }
}

/// Expects an `"expression"` string argument; ignores `working_dir` and
/// cancellation (evaluation is always sub-millisecond).
#[async_trait]
impl ToolRunner for Calculator {
    async fn execute(
        &self,
        _ctx: CancellationToken,
        _name: &str,
        args: &HashMap<String, Value>,
        _working_dir: Option<&str>,
    ) -> Result<RunnerOutput, RunnerError> {
        let expression = args
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| RunnerError::from("missing required argument: expression"))?;

        let value = self
            .evaluate(expression)
            .await
            .map_err(|e| RunnerError::from(e.to_string()))?;

        Ok(RunnerOutput {
            content: value.to_string(),
            metadata: Value::Null,
        })
    }
}
