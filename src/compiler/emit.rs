use crate::compiler::parser::{BinOp, Expr, Program, Stmt, UnaryOp};
use crate::compiler::CompileError;
use crate::models::DialectId;
use crate::pixels::PixelConverter;
use std::fmt::Write;

/// Render a compiled program as one dialect's target script. The emitted
/// texts are identical across dialects except for pixel literals, which
/// resolve to the dialect's string id, double-quoted. An unknown literal is a
/// [`CompileError::PixelId`].
pub fn emit(
    program: &Program,
    dialect: DialectId,
    converter: &PixelConverter,
) -> Result<String, CompileError> {
    let mut out = String::new();
    emit_body(&program.stmts, dialect, converter, 0, &mut out)?;
    Ok(out)
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn emit_body(
    stmts: &[Stmt],
    dialect: DialectId,
    converter: &PixelConverter,
    depth: usize,
    out: &mut String,
) -> Result<(), CompileError> {
    for stmt in stmts {
        emit_stmt(stmt, dialect, converter, depth, out)?;
    }
    Ok(())
}

fn emit_stmt(
    stmt: &Stmt,
    dialect: DialectId,
    converter: &PixelConverter,
    depth: usize,
    out: &mut String,
) -> Result<(), CompileError> {
    match stmt {
        Stmt::Call { func, args } => {
            indent(out, depth);
            out.push_str(func);
            out.push('(');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                emit_expr(arg, dialect, converter, out)?;
            }
            out.push_str(");\n");
        }
        Stmt::If { arms, else_body } => {
            for (i, (cond, body)) in arms.iter().enumerate() {
                indent(out, depth);
                out.push_str(if i == 0 { "if (" } else { "} else if (" });
                emit_expr(cond, dialect, converter, out)?;
                out.push_str(") {\n");
                emit_body(body, dialect, converter, depth + 1, out)?;
            }
            if let Some(body) = else_body {
                indent(out, depth);
                out.push_str("} else {\n");
                emit_body(body, dialect, converter, depth + 1, out)?;
            }
            indent(out, depth);
            out.push_str("}\n");
        }
        Stmt::While { cond, body } => {
            indent(out, depth);
            out.push_str("while (");
            emit_expr(cond, dialect, converter, out)?;
            out.push_str(") {\n");
            emit_body(body, dialect, converter, depth + 1, out)?;
            indent(out, depth);
            out.push_str("}\n");
        }
        Stmt::For {
            var,
            start,
            end,
            body,
        } => {
            indent(out, depth);
            let _ = write!(out, "for ({var} = ");
            emit_expr(start, dialect, converter, out)?;
            let _ = write!(out, "; {var} <= ");
            emit_expr(end, dialect, converter, out)?;
            let _ = write!(out, "; {var} = {var} + 1) {{\n");
            emit_body(body, dialect, converter, depth + 1, out)?;
            indent(out, depth);
            out.push_str("}\n");
        }
        Stmt::Function { name, body } => {
            indent(out, depth);
            let _ = write!(out, "function {name}() {{\n");
            emit_body(body, dialect, converter, depth + 1, out)?;
            indent(out, depth);
            out.push_str("}\n");
        }
        Stmt::Break => {
            indent(out, depth);
            out.push_str("break;\n");
        }
        Stmt::Continue => {
            indent(out, depth);
            out.push_str("continue;\n");
        }
    }
    Ok(())
}

fn emit_expr(
    expr: &Expr,
    dialect: DialectId,
    converter: &PixelConverter,
    out: &mut String,
) -> Result<(), CompileError> {
    match expr {
        Expr::Num(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                let _ = write!(out, "{}", *n as i64);
            } else {
                let _ = write!(out, "{n}");
            }
        }
        Expr::Str(s) => {
            let _ = write!(out, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""));
        }
        Expr::Pixel(literal) => {
            let resolved = converter
                .canonical_of_dialect_str(literal, DialectId::Standard)
                .and_then(|canonical| converter.dialect_str_of_canonical(canonical, dialect))
                .ok_or_else(|| CompileError::PixelId {
                    literal: literal.clone(),
                })?;
            let _ = write!(out, "\"{resolved}\"");
        }
        Expr::Var(name) => out.push_str(name),
        Expr::Index(name, index) => {
            out.push_str(name);
            out.push('[');
            emit_expr(index, dialect, converter, out)?;
            out.push(']');
        }
        Expr::Unary(op, operand) => match op {
            UnaryOp::Not => {
                out.push_str("!(");
                emit_expr(operand, dialect, converter, out)?;
                out.push(')');
            }
            UnaryOp::Neg => {
                out.push_str("-(");
                emit_expr(operand, dialect, converter, out)?;
                out.push(')');
            }
            UnaryOp::Round | UnaryOp::Ceil | UnaryOp::Floor => {
                out.push_str(match op {
                    UnaryOp::Round => "round(",
                    UnaryOp::Ceil => "ceil(",
                    _ => "floor(",
                });
                emit_expr(operand, dialect, converter, out)?;
                out.push(')');
            }
        },
        Expr::Binary(BinOp::Pow, lhs, rhs) => {
            out.push_str("pow(");
            emit_expr(lhs, dialect, converter, out)?;
            out.push_str(", ");
            emit_expr(rhs, dialect, converter, out)?;
            out.push(')');
        }
        Expr::Binary(op, lhs, rhs) => {
            out.push('(');
            emit_expr(lhs, dialect, converter, out)?;
            let _ = write!(out, " {} ", binop_text(*op));
            emit_expr(rhs, dialect, converter, out)?;
            out.push(')');
        }
    }
    Ok(())
}

fn binop_text(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Mod => "%",
        BinOp::Pow => "pow",
        BinOp::Lt => "<",
        BinOp::Gt => ">",
        BinOp::Le => "<=",
        BinOp::Ge => ">=",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::And => "&&",
        BinOp::Or => "||",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::compile;
    use crate::pixels::LookupTable;
    use serde_json::json;
    use std::collections::HashMap;

    const TABLE: &str = "\
id,rps,bps,psp,standard
1,stone,10,1,stone
2,grass,21,2,grass
";

    fn converter() -> PixelConverter {
        let lookup = LookupTable::from_csv(TABLE).unwrap();
        let mut extracted = HashMap::new();
        extracted.insert(DialectId::Rps, json!({ "stone": 5, "grass": 6 }));
        extracted.insert(DialectId::Bps, json!({ "10": 1, "21": 2 }));
        extracted.insert(DialectId::Psp, json!({ "1": 1 }));
        PixelConverter::build(&lookup, &extracted)
    }

    #[test]
    fn emitted_scripts_differ_only_in_pixel_literals() {
        let c = converter();
        let program = compile("SETPX 1 2 {stone}\nPRINT \"done\"").unwrap();
        let rps = emit(&program, DialectId::Rps, &c).unwrap();
        let bps = emit(&program, DialectId::Bps, &c).unwrap();
        assert_eq!(rps, "setPixel(1, 2, \"stone\");\nprint(\"done\");\n");
        assert_eq!(bps, "setPixel(1, 2, \"10\");\nprint(\"done\");\n");
        assert_eq!(rps.replace("\"stone\"", "\"10\""), bps);
    }

    #[test]
    fn unknown_pixel_literal_is_a_pixel_id_error() {
        let c = converter();
        let program = compile("SETPX 1 2 {lava}").unwrap();
        let err = emit(&program, DialectId::Rps, &c).unwrap_err();
        assert_eq!(
            err,
            CompileError::PixelId {
                literal: "lava".into()
            }
        );
        // grass is known to rps but missing from the psp extraction
        let program = compile("SETPX 1 2 {grass}").unwrap();
        assert!(emit(&program, DialectId::Rps, &c).is_ok());
        assert!(emit(&program, DialectId::Psp, &c).is_err());
    }

    #[test]
    fn control_flow_renders_blocks() {
        let c = converter();
        let program = compile("IF <x>==1\nPRINT \"one\"\nELSE\nPRINT \"other\"\nEND").unwrap();
        let text = emit(&program, DialectId::Rps, &c).unwrap();
        assert_eq!(
            text,
            "if ((x == 1)) {\n  print(\"one\");\n} else {\n  print(\"other\");\n}\n"
        );
    }

    #[test]
    fn rounding_and_pow_lower_to_calls() {
        let c = converter();
        let program = compile("WRITE <x> ~=(3 / 2)\nWRITE <y> (2 ^ 8)").unwrap();
        let text = emit(&program, DialectId::Rps, &c).unwrap();
        assert!(text.contains("setVariable(\"x\", round((3 / 2)));"));
        assert!(text.contains("setVariable(\"y\", pow(2, 8));"));
    }
}
