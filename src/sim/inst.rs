use std::fmt;

use super::expr::fmt_double;

/// A program fault raised while decoding or executing an instruction.
/// Any of these drops the offending process; the simulator continues.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    UnknownInstruction(String),
    BadOperand(String),
    UndefinedVariable(String),
    UndefinedLabel(String),
    BadNumber(String),
    BadExpression(String),
    MissingData,
    Io(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Fault::UnknownInstruction(line) => write!(f, "invalid instruction '{}'", line),
            Fault::BadOperand(token) => write!(f, "bad operand '{}'", token),
            Fault::UndefinedVariable(name) => write!(f, "variable '{}' not defined", name),
            Fault::UndefinedLabel(name) => write!(f, "label '{}' not defined", name),
            Fault::BadNumber(token) => write!(f, "'{}' is not a number", token),
            Fault::BadExpression(expr) => write!(f, "malformed expression '{}'", expr),
            Fault::MissingData => write!(f, "data reply missing"),
            Fault::Io(message) => write!(f, "io failure: {}", message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl Cmp {
    pub fn parse(token: &str) -> Option<Cmp> {
        match token {
            "==" => Some(Cmp::Eq),
            "!=" => Some(Cmp::Ne),
            "<" => Some(Cmp::Lt),
            ">" => Some(Cmp::Gt),
            "<=" => Some(Cmp::Le),
            ">=" => Some(Cmp::Ge),
            _ => None,
        }
    }

    /// Compare two operand strings. Operands that parse as numbers are
    /// normalised to double form first, so `5` and `5.0` compare equal;
    /// the ordering comparators require both sides to be numeric.
    pub fn compare(&self, lhs: &str, rhs: &str) -> Result<bool, Fault> {
        let canon = |s: &str| match s.parse::<f64>() {
            Ok(x) => fmt_double(x),
            Err(_) => s.to_string(),
        };
        let number = |s: &str| {
            s.parse::<f64>()
                .map_err(|_| Fault::BadNumber(s.to_string()))
        };
        let (lhs, rhs) = (canon(lhs), canon(rhs));
        match self {
            Cmp::Eq => Ok(lhs == rhs),
            Cmp::Ne => Ok(lhs != rhs),
            Cmp::Lt => Ok(number(&lhs)? < number(&rhs)?),
            Cmp::Gt => Ok(number(&lhs)? > number(&rhs)?),
            Cmp::Le => Ok(number(&lhs)? <= number(&rhs)?),
            Cmp::Ge => Ok(number(&lhs)? >= number(&rhs)?),
        }
    }
}

/// One decoded instruction line. Decoding happens on every execution;
/// the per-process instruction cache stores the raw line text.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Null,
    Var {
        name: String,
        addr: usize,
        value: Option<String>,
    },
    Alloc(usize),
    Free(usize),
    Exit,
    Jump(String),
    JumpIf {
        lhs: String,
        cmp: Cmp,
        rhs: String,
        label: String,
    },
    Set {
        target: String,
        source: String,
    },
    Out(String),
    Inc(String),
    Dec(String),
    Math(String),
}

impl Inst {
    /// Decode a single instruction line. The optional leading `label:`
    /// prefix must already be stripped; blank lines decode to `Null`.
    pub fn parse(line: &str) -> Result<Inst, Fault> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Inst::Null);
        }
        let number = |token: &str| {
            token
                .parse::<usize>()
                .map_err(|_| Fault::BadOperand(token.to_string()))
        };
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["null"] => Ok(Inst::Null),
            ["var", name, addr] => Ok(Inst::Var {
                name: name.to_string(),
                addr: number(addr)?,
                value: None,
            }),
            ["var", name, addr, value] => Ok(Inst::Var {
                name: name.to_string(),
                addr: number(addr)?,
                value: Some(value.to_string()),
            }),
            ["alloc", blocks] => Ok(Inst::Alloc(number(blocks)?)),
            ["free", blocks] => Ok(Inst::Free(number(blocks)?)),
            ["exit"] => Ok(Inst::Exit),
            ["jump", label] => Ok(Inst::Jump(label.to_string())),
            ["jumpif", lhs, cmp, rhs, label] => Ok(Inst::JumpIf {
                lhs: lhs.to_string(),
                cmp: Cmp::parse(cmp).ok_or_else(|| Fault::BadOperand(cmp.to_string()))?,
                rhs: rhs.to_string(),
                label: label.to_string(),
            }),
            ["set", target, source] => Ok(Inst::Set {
                target: target.to_string(),
                source: source.to_string(),
            }),
            ["out", var] => Ok(Inst::Out(var.to_string())),
            ["inc", var] => Ok(Inst::Inc(var.to_string())),
            ["dec", var] => Ok(Inst::Dec(var.to_string())),
            ["math", rest @ ..] if !rest.is_empty() => Ok(Inst::Math(rest.concat())),
            _ => Err(Fault::UnknownInstruction(line.to_string())),
        }
    }
}
