use crate::compiler::parser::{BinOp, Expr, Program, Stmt, UnaryOp};
use std::collections::HashMap;
use thiserror::Error;

/// Runtime value of the controller language.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Str(String),
    Bool(bool),
    Null,
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::Null => false,
        }
    }

    pub fn as_num(&self) -> f64 {
        match self {
            Value::Num(n) => *n,
            Value::Bool(true) => 1.0,
            Value::Bool(false) | Value::Null => 0.0,
            Value::Str(s) => s.parse().unwrap_or(0.0),
        }
    }

    pub fn render(&self) -> String {
        match self {
            Value::Num(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Value::Num(n) => format!("{n}"),
            Value::Str(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Null => "null".to_string(),
        }
    }
}

/// The simulator-side API a compiled program runs against. Every lowered
/// operation arrives as one call; the host's return value feeds back into
/// expression evaluation (relevant for `getPixel`/`getAmount`).
pub trait ControllerHost {
    fn call(&mut self, func: &str, args: &[Value]) -> Value;
}

#[derive(Debug, Error, PartialEq)]
pub enum ExecError {
    #[error("program exceeded {0} operations")]
    Runaway(u64),
    #[error("array '{0}' is not defined")]
    UnknownArray(String),
}

const MAX_OPS: u64 = 1_000_000;

enum Flow {
    Normal,
    Break,
    Continue,
}

struct Interp<'p, 'h> {
    vars: HashMap<String, Value>,
    arrays: HashMap<String, Vec<Value>>,
    functions: HashMap<String, &'p [Stmt]>,
    host: &'h mut dyn ControllerHost,
    ops: u64,
}

impl Program {
    /// Execute the program against a host, from the top. `FUNCTION` blocks
    /// register their bodies; `FNCALL` prefers a registered body and falls
    /// through to the host otherwise.
    pub fn run(&self, host: &mut dyn ControllerHost) -> Result<(), ExecError> {
        let mut interp = Interp {
            vars: HashMap::new(),
            arrays: HashMap::new(),
            functions: HashMap::new(),
            host,
            ops: 0,
        };
        interp.exec_body(&self.stmts)?;
        Ok(())
    }
}

impl<'p, 'h> Interp<'p, 'h> {
    fn tick_op(&mut self) -> Result<(), ExecError> {
        self.ops += 1;
        if self.ops > MAX_OPS {
            return Err(ExecError::Runaway(MAX_OPS));
        }
        Ok(())
    }

    fn exec_body(&mut self, stmts: &'p [Stmt]) -> Result<Flow, ExecError> {
        for stmt in stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &'p Stmt) -> Result<Flow, ExecError> {
        self.tick_op()?;
        match stmt {
            Stmt::Call { func, args } => {
                self.exec_call(func, args)?;
                Ok(Flow::Normal)
            }
            Stmt::If { arms, else_body } => {
                for (cond, body) in arms {
                    if self.eval(cond)?.truthy() {
                        return self.exec_body(body);
                    }
                }
                if let Some(body) = else_body {
                    return self.exec_body(body);
                }
                Ok(Flow::Normal)
            }
            Stmt::While { cond, body } => {
                while self.eval(cond)?.truthy() {
                    self.tick_op()?;
                    match self.exec_body(body)? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                var,
                start,
                end,
                body,
            } => {
                let mut i = self.eval(start)?.as_num();
                let end = self.eval(end)?.as_num();
                while i <= end {
                    self.tick_op()?;
                    self.vars.insert(var.clone(), Value::Num(i));
                    match self.exec_body(body)? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => {}
                    }
                    i += 1.0;
                }
                Ok(Flow::Normal)
            }
            Stmt::Function { name, body } => {
                self.functions.insert(name.clone(), body);
                Ok(Flow::Normal)
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
        }
    }

    fn exec_call(&mut self, func: &str, args: &[Expr]) -> Result<Value, ExecError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }
        match func {
            "setVariable" => {
                if let [Value::Str(name), value] = &values[..] {
                    self.vars.insert(name.clone(), value.clone());
                }
            }
            "defArray" => {
                if let Some(Value::Str(name)) = values.first() {
                    let size = values.get(1).map(|v| v.as_num() as usize).unwrap_or(0);
                    let init = values.get(2).cloned().unwrap_or(Value::Null);
                    self.arrays.insert(name.clone(), vec![init; size]);
                }
            }
            "setArray" => {
                if let [Value::Str(name), index, value] = &values[..] {
                    let slot_index = index.as_num() as usize;
                    let array = self
                        .arrays
                        .get_mut(name)
                        .ok_or_else(|| ExecError::UnknownArray(name.clone()))?;
                    if let Some(slot) = array.get_mut(slot_index) {
                        *slot = value.clone();
                    }
                }
            }
            "callFunction" => {
                if let Some(Value::Str(name)) = values.first() {
                    if let Some(body) = self.functions.get(name.as_str()) {
                        let body = *body;
                        self.exec_body(body)?;
                        return Ok(Value::Null);
                    }
                }
            }
            _ => {}
        }
        Ok(self.host.call(func, &values))
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, ExecError> {
        self.tick_op()?;
        Ok(match expr {
            Expr::Num(n) => Value::Num(*n),
            Expr::Str(s) => Value::Str(s.clone()),
            // executed programs see the canonical literal text
            Expr::Pixel(p) => Value::Str(p.clone()),
            Expr::Var(name) => self.vars.get(name).cloned().unwrap_or(Value::Null),
            Expr::Index(name, index) => {
                let i = self.eval(index)?.as_num() as usize;
                let array = self
                    .arrays
                    .get(name)
                    .ok_or_else(|| ExecError::UnknownArray(name.clone()))?;
                array.get(i).cloned().unwrap_or(Value::Null)
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Value::Bool(!value.truthy()),
                    UnaryOp::Neg => Value::Num(-value.as_num()),
                    UnaryOp::Round => Value::Num(value.as_num().round()),
                    UnaryOp::Ceil => Value::Num(value.as_num().ceil()),
                    UnaryOp::Floor => Value::Num(value.as_num().floor()),
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                match op {
                    BinOp::And => {
                        let left = self.eval(lhs)?;
                        return Ok(if left.truthy() { self.eval(rhs)? } else { left });
                    }
                    BinOp::Or => {
                        let left = self.eval(lhs)?;
                        return Ok(if left.truthy() { left } else { self.eval(rhs)? });
                    }
                    _ => {}
                }
                let left = self.eval(lhs)?;
                let right = self.eval(rhs)?;
                match op {
                    BinOp::Add => match (&left, &right) {
                        (Value::Str(_), _) | (_, Value::Str(_)) => {
                            Value::Str(format!("{}{}", left.render(), right.render()))
                        }
                        _ => Value::Num(left.as_num() + right.as_num()),
                    },
                    BinOp::Sub => Value::Num(left.as_num() - right.as_num()),
                    BinOp::Mul => Value::Num(left.as_num() * right.as_num()),
                    BinOp::Div => Value::Num(left.as_num() / right.as_num()),
                    BinOp::Mod => Value::Num(left.as_num() % right.as_num()),
                    BinOp::Pow => Value::Num(left.as_num().powf(right.as_num())),
                    BinOp::Lt => Value::Bool(left.as_num() < right.as_num()),
                    BinOp::Gt => Value::Bool(left.as_num() > right.as_num()),
                    BinOp::Le => Value::Bool(left.as_num() <= right.as_num()),
                    BinOp::Ge => Value::Bool(left.as_num() >= right.as_num()),
                    BinOp::Eq => Value::Bool(values_equal(&left, &right)),
                    BinOp::Ne => Value::Bool(!values_equal(&left, &right)),
                    BinOp::And | BinOp::Or => unreachable!("handled above"),
                }
            }
        })
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => left.as_num() == right.as_num(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::compile;

    /// Records every lowered call in order.
    #[derive(Default)]
    struct RecordingHost {
        calls: Vec<(String, Vec<Value>)>,
    }

    impl ControllerHost for RecordingHost {
        fn call(&mut self, func: &str, args: &[Value]) -> Value {
            self.calls.push((func.to_string(), args.to_vec()));
            Value::Null
        }
    }

    #[test]
    fn write_then_conditional_print() {
        let program = compile("WRITE <x> 1\nIF <x>==1\nPRINT \"ok\"\nEND").unwrap();
        let mut host = RecordingHost::default();
        program.run(&mut host).unwrap();
        assert_eq!(host.calls[0].0, "setVariable");
        assert_eq!(
            host.calls[0].1,
            vec![Value::Str("x".into()), Value::Num(1.0)]
        );
        assert_eq!(host.calls[1].0, "print");
        assert_eq!(host.calls[1].1, vec![Value::Str("ok".into())]);
    }

    #[test]
    fn while_loop_counts_and_breaks() {
        let source = "\
WRITE <n> 0
WHILE 1
WRITE <n> (<n> + 1)
IF <n>>=3
BREAK
END
END
PRINT <n>
";
        let program = compile(source).unwrap();
        let mut host = RecordingHost::default();
        program.run(&mut host).unwrap();
        let (func, args) = host.calls.last().unwrap();
        assert_eq!(func, "print");
        assert_eq!(args, &vec![Value::Num(3.0)]);
    }

    #[test]
    fn for_loop_iterates_inclusive_bounds() {
        let program = compile("FOR <i> 1 3\nPRINT <i>\nEND").unwrap();
        let mut host = RecordingHost::default();
        program.run(&mut host).unwrap();
        let printed: Vec<f64> = host
            .calls
            .iter()
            .filter(|(f, _)| f == "print")
            .map(|(_, a)| a[0].as_num())
            .collect();
        assert_eq!(printed, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn functions_register_and_run_on_fncall() {
        let source = "\
FUNCTION greet
PRINT \"hi\"
END
FNCALL greet
";
        let program = compile(source).unwrap();
        let mut host = RecordingHost::default();
        program.run(&mut host).unwrap();
        assert!(host.calls.iter().any(|(f, a)| {
            f == "print" && a == &vec![Value::Str("hi".into())]
        }));
    }

    #[test]
    fn arrays_define_write_and_read() {
        let source = "\
DEFARR <a> 4 0
WRITEARR <a> 2 7
PRINT <a[2]> <a[3]>
";
        let program = compile(source).unwrap();
        let mut host = RecordingHost::default();
        program.run(&mut host).unwrap();
        let (_, args) = host.calls.last().unwrap();
        assert_eq!(args, &vec![Value::Num(7.0), Value::Num(0.0)]);
    }

    #[test]
    fn computed_arguments_reach_the_host() {
        let program = compile("WRITE <p> (1 + 1)\nSETPX <p> 0 {stone}").unwrap();
        let mut host = RecordingHost::default();
        program.run(&mut host).unwrap();
        let setpx = host.calls.iter().find(|(f, _)| f == "setPixel").unwrap();
        assert_eq!(setpx.1[0], Value::Num(2.0));
        assert_eq!(setpx.1[2], Value::Str("stone".into()));
    }

    #[test]
    fn infinite_loop_is_cut_off() {
        let program = compile("WHILE 1\nWRITE <x> 1\nEND").unwrap();
        let mut host = RecordingHost::default();
        assert!(matches!(
            program.run(&mut host),
            Err(ExecError::Runaway(_))
        ));
    }

    #[test]
    fn undefined_array_read_is_an_error() {
        let program = compile("PRINT <nope[0]>").unwrap();
        let mut host = RecordingHost::default();
        assert_eq!(
            program.run(&mut host),
            Err(ExecError::UnknownArray("nope".into()))
        );
    }
}
