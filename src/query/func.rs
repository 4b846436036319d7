//! Aggregate function expressions such as `avg`, `count>5` or `diff:max`.

use std::{fmt, str::FromStr};

use crate::db::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountOp {
    Lt,
    Gt,
    Eq,
    Ne,
}

impl CountOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CountOp::Lt => "<",
            CountOp::Gt => ">",
            CountOp::Eq => "=",
            CountOp::Ne => "!=",
        }
    }

    pub fn matches(&self, value: f64, operand: f64) -> bool {
        match self {
            CountOp::Lt => value < operand,
            CountOp::Gt => value > operand,
            CountOp::Eq => value == operand,
            CountOp::Ne => value != operand,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggregateFunc {
    Avg,
    Min,
    Max,
    On,
    Sum,
    Integrate,
    Count { op: CountOp, operand: f64 },
    CountAll,
    /// Unaggregated values: the latest one for `single`, every record for
    /// `series`.
    Raw,
}

impl AggregateFunc {
    /// Results of these functions are rounded to the configured precision.
    pub fn is_rounded(&self) -> bool {
        matches!(self, AggregateFunc::Avg | AggregateFunc::On)
    }

    fn parse_count(rest: &str) -> Result<Self, StoreError> {
        if rest.is_empty() {
            return Ok(AggregateFunc::Count {
                op: CountOp::Ne,
                operand: 0.0,
            });
        }

        let (op, operand) = if let Some(operand) = rest.strip_prefix("<>") {
            (CountOp::Ne, operand)
        } else if let Some(operand) = rest.strip_prefix("!=") {
            (CountOp::Ne, operand)
        } else if let Some(operand) = rest.strip_prefix('<') {
            (CountOp::Lt, operand)
        } else if let Some(operand) = rest.strip_prefix('>') {
            (CountOp::Gt, operand)
        } else if let Some(operand) = rest.strip_prefix('=') {
            (CountOp::Eq, operand)
        } else {
            return Err(StoreError::InvalidQuery(format!(
                "unknown count comparison in 'count{rest}'"
            )));
        };

        let operand = operand.trim().parse::<f64>().map_err(|_| {
            StoreError::InvalidQuery(format!("count operand '{operand}' is not numeric"))
        })?;

        Ok(AggregateFunc::Count { op, operand })
    }
}

impl FromStr for AggregateFunc {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        match value {
            "avg" => Ok(AggregateFunc::Avg),
            "min" => Ok(AggregateFunc::Min),
            "max" => Ok(AggregateFunc::Max),
            "on" => Ok(AggregateFunc::On),
            "sum" => Ok(AggregateFunc::Sum),
            "integrate" => Ok(AggregateFunc::Integrate),
            "countall" => Ok(AggregateFunc::CountAll),
            "raw" => Ok(AggregateFunc::Raw),
            other => match other.strip_prefix("count") {
                Some(rest) => Self::parse_count(rest.trim()),
                None => Err(StoreError::InvalidQuery(format!(
                    "unknown aggregate function '{other}'"
                ))),
            },
        }
    }
}

impl fmt::Display for AggregateFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateFunc::Avg => f.write_str("avg"),
            AggregateFunc::Min => f.write_str("min"),
            AggregateFunc::Max => f.write_str("max"),
            AggregateFunc::On => f.write_str("on"),
            AggregateFunc::Sum => f.write_str("sum"),
            AggregateFunc::Integrate => f.write_str("integrate"),
            AggregateFunc::CountAll => f.write_str("countall"),
            AggregateFunc::Raw => f.write_str("raw"),
            AggregateFunc::Count { op, operand } => write!(f, "count{}{}", op.as_str(), operand),
        }
    }
}

/// Post-processing applied to a finished series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalizer {
    Diff,
}

impl Finalizer {
    /// Applies the finalizer to `points`.
    ///
    /// `diff` replaces each point by its difference to the previous one;
    /// the first point has no predecessor and is dropped.
    pub fn apply(&self, points: Vec<(i64, Option<f64>)>) -> Vec<(i64, Option<f64>)> {
        match self {
            Finalizer::Diff => points
                .windows(2)
                .map(|pair| {
                    let (_, previous) = pair[0];
                    let (time, current) = pair[1];
                    let delta = match (previous, current) {
                        (Some(previous), Some(current)) => Some(current - previous),
                        _ => None,
                    };
                    (time, delta)
                })
                .collect(),
        }
    }
}

/// A complete function expression: an aggregate plus optional finalizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuncSpec {
    pub func: AggregateFunc,
    pub finalizer: Option<Finalizer>,
}

impl From<AggregateFunc> for FuncSpec {
    fn from(func: AggregateFunc) -> Self {
        Self {
            func,
            finalizer: None,
        }
    }
}

impl FromStr for FuncSpec {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some((finalizer, func)) => {
                let finalizer = match finalizer.trim() {
                    "diff" => Finalizer::Diff,
                    other => {
                        return Err(StoreError::InvalidQuery(format!(
                            "unknown series finalizer '{other}'"
                        )))
                    }
                };
                Ok(Self {
                    func: func.parse()?,
                    finalizer: Some(finalizer),
                })
            }
            None => Ok(Self {
                func: value.parse()?,
                finalizer: None,
            }),
        }
    }
}

impl fmt::Display for FuncSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.finalizer {
            Some(Finalizer::Diff) => write!(f, "diff:{}", self.func),
            None => write!(f, "{}", self.func),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_functions() {
        assert_eq!("avg".parse::<AggregateFunc>().unwrap(), AggregateFunc::Avg);
        assert_eq!("on".parse::<AggregateFunc>().unwrap(), AggregateFunc::On);
        assert_eq!(
            "countall".parse::<AggregateFunc>().unwrap(),
            AggregateFunc::CountAll
        );
        assert_eq!("raw".parse::<AggregateFunc>().unwrap(), AggregateFunc::Raw);
        assert_eq!(AggregateFunc::Raw.to_string(), "raw");
    }

    #[test]
    fn test_parse_count_defaults_to_non_zero() {
        assert_eq!(
            "count".parse::<AggregateFunc>().unwrap(),
            AggregateFunc::Count {
                op: CountOp::Ne,
                operand: 0.0
            }
        );
    }

    #[test]
    fn test_parse_count_with_comparison() {
        assert_eq!(
            "count>5".parse::<AggregateFunc>().unwrap(),
            AggregateFunc::Count {
                op: CountOp::Gt,
                operand: 5.0
            }
        );
        assert_eq!(
            "count<>2".parse::<AggregateFunc>().unwrap(),
            AggregateFunc::Count {
                op: CountOp::Ne,
                operand: 2.0
            }
        );
        assert!("count~3".parse::<AggregateFunc>().is_err());
    }

    #[test]
    fn test_unknown_function_is_invalid_query() {
        assert!(matches!(
            "median".parse::<AggregateFunc>(),
            Err(StoreError::InvalidQuery(_))
        ));
        assert!(matches!(
            "ratio:avg".parse::<FuncSpec>(),
            Err(StoreError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_parse_diff_finalizer() {
        let spec: FuncSpec = "diff:max".parse().unwrap();
        assert_eq!(spec.func, AggregateFunc::Max);
        assert_eq!(spec.finalizer, Some(Finalizer::Diff));
        assert_eq!(spec.to_string(), "diff:max");
    }

    #[test]
    fn test_diff_keeps_gaps_empty() {
        let points = vec![(1, Some(1.0)), (2, Some(4.0)), (3, None), (4, Some(10.0))];
        assert_eq!(
            Finalizer::Diff.apply(points),
            vec![(2, Some(3.0)), (3, None), (4, None)]
        );
    }
}
