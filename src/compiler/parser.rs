use crate::compiler::lexer::{lex_field, split_fields, Token};
use crate::compiler::CompileError;

/// Expression AST. Rounding operators and `^` are already lowered to their
/// target operations by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Str(String),
    /// `{identifier}` — a pixel literal in standard naming, resolved per
    /// dialect at emission.
    Pixel(String),
    Var(String),
    Index(String, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Round,
    Ceil,
    Floor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

/// Lowered statement list. Simple instructions become [`Stmt::Call`] with
/// their target operation name; control-flow instructions become blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Call {
        func: &'static str,
        args: Vec<Expr>,
    },
    If {
        arms: Vec<(Expr, Vec<Stmt>)>,
        else_body: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    For {
        var: String,
        start: Expr,
        end: Expr,
        body: Vec<Stmt>,
    },
    Function {
        name: String,
        body: Vec<Stmt>,
    },
    Break,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub stmts: Vec<Stmt>,
}

// Block kinds tracked by the parser stack: 0 = conditional, 1 = loop,
// 2 = iteration/function scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Conditional,
    Loop,
    Scope,
}

enum Frame {
    If {
        arms: Vec<(Expr, Vec<Stmt>)>,
        current_cond: Expr,
        in_else: bool,
    },
    While {
        cond: Expr,
    },
    For {
        var: String,
        start: Expr,
        end: Expr,
    },
    Function {
        name: String,
    },
}

struct OpenBlock {
    kind: BlockKind,
    opened_at: usize,
    frame: Frame,
    body: Vec<Stmt>,
}

/// Simple (non-control-flow) instructions: lowered name and argument range.
fn instruction_spec(name: &str) -> Option<(&'static str, usize, usize)> {
    Some(match name {
        "WRITE" => ("setVariable", 2, 2),
        "DEFARR" => ("defArray", 2, 3),
        "WRITEARR" => ("setArray", 3, 3),
        "FNCALL" => ("callFunction", 1, usize::MAX),
        "WAIT" => ("wait", 1, 1),
        "PRINT" => ("print", 1, usize::MAX),
        "SETPX" => ("setPixel", 3, 3),
        "GETPX" => ("getPixel", 2, 2),
        "SETAM" => ("setAmount", 3, 3),
        "GETAM" => ("getAmount", 2, 2),
        "CMOVE" => ("moveCamera", 3, 4),
        "CSHAKE" => ("shakeCamera", 3, 3),
        "WIN" => ("triggerWin", 1, 1),
        "SOUND" => ("playSound", 3, 4),
        "STARTSIM" => ("startSim", 0, 1),
        "STOPSIM" => ("stopSim", 0, 0),
        "TICK" => ("awaitTick", 0, 0),
        _ => return None,
    })
}

/// Single-pass compile of PixSimAssembly source into the dialect-neutral IR.
pub fn compile(source: &str) -> Result<Program, CompileError> {
    let mut program = Program::default();
    let mut stack: Vec<OpenBlock> = Vec::new();

    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let fields = split_fields(raw_line, line_no)?;
        if fields.is_empty() {
            continue;
        }
        let instr = fields[0].as_str();
        let args = &fields[1..];

        match instr {
            "IF" => {
                let cond = parse_single_expr(args, line_no, "IF")?;
                stack.push(OpenBlock {
                    kind: BlockKind::Conditional,
                    opened_at: line_no,
                    frame: Frame::If {
                        arms: Vec::new(),
                        current_cond: cond,
                        in_else: false,
                    },
                    body: Vec::new(),
                });
            }
            "ELIF" => {
                let cond = parse_single_expr(args, line_no, "ELIF")?;
                let top = stack.last_mut().ok_or_else(|| {
                    CompileError::syntax(line_no, "ELIF outside a conditional block")
                })?;
                match &mut top.frame {
                    Frame::If {
                        arms,
                        current_cond,
                        in_else,
                    } if !*in_else => {
                        let finished = std::mem::take(&mut top.body);
                        arms.push((current_cond.clone(), finished));
                        *current_cond = cond;
                    }
                    _ => {
                        return Err(CompileError::syntax(
                            line_no,
                            "ELIF outside a conditional block",
                        ))
                    }
                }
            }
            "ELSE" => {
                expect_no_args(args, line_no, "ELSE")?;
                let top = stack.last_mut().ok_or_else(|| {
                    CompileError::syntax(line_no, "ELSE outside a conditional block")
                })?;
                match &mut top.frame {
                    Frame::If {
                        arms,
                        current_cond,
                        in_else,
                    } if !*in_else => {
                        let finished = std::mem::take(&mut top.body);
                        arms.push((current_cond.clone(), finished));
                        *in_else = true;
                    }
                    _ => {
                        return Err(CompileError::syntax(
                            line_no,
                            "ELSE outside a conditional block",
                        ))
                    }
                }
            }
            "WHILE" => {
                let cond = parse_single_expr(args, line_no, "WHILE")?;
                stack.push(OpenBlock {
                    kind: BlockKind::Loop,
                    opened_at: line_no,
                    frame: Frame::While { cond },
                    body: Vec::new(),
                });
            }
            "FOR" => {
                if args.len() != 3 {
                    return Err(CompileError::syntax(
                        line_no,
                        format!("FOR takes 3 arguments, got {}", args.len()),
                    ));
                }
                let var = parse_var_name(&args[0], line_no)?;
                let start = parse_expr_field(&args[1], line_no)?;
                let end = parse_expr_field(&args[2], line_no)?;
                stack.push(OpenBlock {
                    kind: BlockKind::Scope,
                    opened_at: line_no,
                    frame: Frame::For { var, start, end },
                    body: Vec::new(),
                });
            }
            "FUNCTION" => {
                if args.len() != 1 {
                    return Err(CompileError::syntax(
                        line_no,
                        format!("FUNCTION takes 1 argument, got {}", args.len()),
                    ));
                }
                let name = parse_word(&args[0], line_no)?;
                stack.push(OpenBlock {
                    kind: BlockKind::Scope,
                    opened_at: line_no,
                    frame: Frame::Function { name },
                    body: Vec::new(),
                });
            }
            "END" => {
                expect_no_args(args, line_no, "END")?;
                let block = stack
                    .pop()
                    .ok_or_else(|| CompileError::syntax(line_no, "END without an open block"))?;
                let stmt = close_block(block);
                push_stmt(&mut stack, &mut program, stmt);
            }
            "BREAK" | "CONTINUE" => {
                expect_no_args(args, line_no, instr)?;
                if !inside_loop(&stack) {
                    return Err(CompileError::syntax(
                        line_no,
                        format!("{instr} outside a loop"),
                    ));
                }
                let stmt = if instr == "BREAK" {
                    Stmt::Break
                } else {
                    Stmt::Continue
                };
                push_stmt(&mut stack, &mut program, stmt);
            }
            _ => {
                let Some((func, min, max)) = instruction_spec(instr) else {
                    return Err(CompileError::syntax(
                        line_no,
                        format!("unknown instruction '{instr}'"),
                    ));
                };
                if args.len() < min || args.len() > max {
                    return Err(CompileError::syntax(
                        line_no,
                        format!("{instr} takes {} arguments, got {}", range_text(min, max), args.len()),
                    ));
                }
                let exprs = lower_args(instr, args, line_no)?;
                push_stmt(&mut stack, &mut program, Stmt::Call { func, args: exprs });
            }
        }
    }

    if let Some(block) = stack.last() {
        return Err(CompileError::syntax(
            block.opened_at,
            "block is never closed",
        ));
    }
    Ok(program)
}

fn range_text(min: usize, max: usize) -> String {
    if max == usize::MAX {
        format!("at least {min}")
    } else if min == max {
        format!("{min}")
    } else {
        format!("{min} to {max}")
    }
}

/// Instructions whose leading argument is a name, not an expression.
fn lower_args(instr: &str, args: &[String], line_no: usize) -> Result<Vec<Expr>, CompileError> {
    let mut exprs = Vec::with_capacity(args.len());
    let named_first = matches!(instr, "WRITE" | "DEFARR" | "WRITEARR" | "FNCALL");
    for (pos, field) in args.iter().enumerate() {
        if pos == 0 && named_first {
            let name = match instr {
                "FNCALL" => parse_word(field, line_no).or_else(|_| parse_var_name(field, line_no))?,
                _ => parse_var_name(field, line_no)?,
            };
            exprs.push(Expr::Str(name));
        } else {
            exprs.push(parse_expr_field(field, line_no)?);
        }
    }
    Ok(exprs)
}

fn close_block(block: OpenBlock) -> Stmt {
    match block.frame {
        Frame::If {
            mut arms,
            current_cond,
            in_else,
        } => {
            if in_else {
                Stmt::If {
                    arms,
                    else_body: Some(block.body),
                }
            } else {
                arms.push((current_cond, block.body));
                Stmt::If {
                    arms,
                    else_body: None,
                }
            }
        }
        Frame::While { cond } => Stmt::While {
            cond,
            body: block.body,
        },
        Frame::For { var, start, end } => Stmt::For {
            var,
            start,
            end,
            body: block.body,
        },
        Frame::Function { name } => Stmt::Function {
            name,
            body: block.body,
        },
    }
}

fn push_stmt(stack: &mut [OpenBlock], program: &mut Program, stmt: Stmt) {
    match stack.last_mut() {
        Some(top) => top.body.push(stmt),
        None => program.stmts.push(stmt),
    }
}

/// BREAK/CONTINUE bind to the nearest WHILE or FOR; a FUNCTION boundary in
/// between makes them illegal.
fn inside_loop(stack: &[OpenBlock]) -> bool {
    for block in stack.iter().rev() {
        match block.kind {
            BlockKind::Loop => return true,
            // iteration and function scopes share a kind; only iteration
            // admits BREAK/CONTINUE
            BlockKind::Scope => return matches!(block.frame, Frame::For { .. }),
            BlockKind::Conditional => {}
        }
    }
    false
}

fn expect_no_args(args: &[String], line_no: usize, instr: &str) -> Result<(), CompileError> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(CompileError::syntax(
            line_no,
            format!("{instr} takes no arguments"),
        ))
    }
}

fn parse_single_expr(args: &[String], line_no: usize, instr: &str) -> Result<Expr, CompileError> {
    if args.len() != 1 {
        return Err(CompileError::syntax(
            line_no,
            format!("{instr} takes 1 argument, got {}", args.len()),
        ));
    }
    parse_expr_field(&args[0], line_no)
}

fn parse_var_name(field: &str, line_no: usize) -> Result<String, CompileError> {
    let tokens = lex_field(field, line_no)?;
    match tokens.as_slice() {
        [Token::Var(name)] => Ok(name.clone()),
        _ => Err(CompileError::syntax(
            line_no,
            format!("expected a <variable>, got '{field}'"),
        )),
    }
}

fn parse_word(field: &str, line_no: usize) -> Result<String, CompileError> {
    let tokens = lex_field(field, line_no)?;
    match tokens.as_slice() {
        [Token::Word(name)] => Ok(name.clone()),
        _ => Err(CompileError::syntax(
            line_no,
            format!("expected a name, got '{field}'"),
        )),
    }
}

pub(crate) fn parse_expr_field(field: &str, line_no: usize) -> Result<Expr, CompileError> {
    let tokens = lex_field(field, line_no)?;
    parse_expr_tokens(&tokens, line_no)
}

fn parse_expr_tokens(tokens: &[Token], line_no: usize) -> Result<Expr, CompileError> {
    let mut parser = ExprParser {
        tokens,
        pos: 0,
        line_no,
    };
    let expr = parser.parse_binary(0)?;
    if parser.pos != tokens.len() {
        return Err(CompileError::syntax(
            line_no,
            "trailing tokens in expression",
        ));
    }
    Ok(expr)
}

struct ExprParser<'a> {
    tokens: &'a [Token],
    pos: usize,
    line_no: usize,
}

fn binop_of(op: &str) -> Option<(BinOp, u8)> {
    // precedence climbs; ^ binds tightest of the binaries and is
    // right-associative.
    Some(match op {
        "||" => (BinOp::Or, 1),
        "&&" => (BinOp::And, 2),
        "==" => (BinOp::Eq, 3),
        "!=" => (BinOp::Ne, 3),
        "<" => (BinOp::Lt, 4),
        ">" => (BinOp::Gt, 4),
        "<=" => (BinOp::Le, 4),
        ">=" => (BinOp::Ge, 4),
        "+" => (BinOp::Add, 5),
        "-" => (BinOp::Sub, 5),
        "*" => (BinOp::Mul, 6),
        "/" => (BinOp::Div, 6),
        "%" => (BinOp::Mod, 6),
        "^" => (BinOp::Pow, 7),
        _ => return None,
    })
}

impl<'a> ExprParser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_unary()?;
        while let Some(Token::Op(op)) = self.peek() {
            let Some((binop, prec)) = binop_of(op) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let next_min = if binop == BinOp::Pow { prec } else { prec + 1 };
            let rhs = self.parse_binary(next_min)?;
            lhs = Expr::Binary(binop, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        if let Some(Token::Op(op)) = self.peek() {
            let unary = match *op {
                "!" => Some(UnaryOp::Not),
                "-" => Some(UnaryOp::Neg),
                "~=" => Some(UnaryOp::Round),
                "~>" => Some(UnaryOp::Ceil),
                "~<" => Some(UnaryOp::Floor),
                _ => None,
            };
            if let Some(unary) = unary {
                self.pos += 1;
                let operand = self.parse_unary()?;
                return Ok(Expr::Unary(unary, Box::new(operand)));
            }
            return Err(CompileError::syntax(
                self.line_no,
                format!("misplaced operator '{op}'"),
            ));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(Expr::Num(*n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s.clone())),
            Some(Token::Pixel(p)) => Ok(Expr::Pixel(p.clone())),
            Some(Token::Var(name)) => Ok(Expr::Var(name.clone())),
            Some(Token::Index(name, inner)) => {
                let index = parse_expr_tokens(inner, self.line_no)?;
                Ok(Expr::Index(name.clone(), Box::new(index)))
            }
            Some(Token::Group(inner)) => parse_expr_tokens(inner, self.line_no),
            Some(Token::Word(word)) => Err(CompileError::syntax(
                self.line_no,
                format!("unexpected name '{word}' in expression"),
            )),
            Some(Token::Op(op)) => Err(CompileError::syntax(
                self.line_no,
                format!("misplaced operator '{op}'"),
            )),
            None => Err(CompileError::syntax(self.line_no, "expression is empty")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowers_simple_instructions() {
        let program = compile("WRITE <x> 1\nPRINT \"ok\" <x>").unwrap();
        assert_eq!(
            program.stmts[0],
            Stmt::Call {
                func: "setVariable",
                args: vec![Expr::Str("x".into()), Expr::Num(1.0)],
            }
        );
        assert_eq!(
            program.stmts[1],
            Stmt::Call {
                func: "print",
                args: vec![Expr::Str("ok".into()), Expr::Var("x".into())],
            }
        );
    }

    #[test]
    fn balanced_blocks_compile() {
        let source = "\
IF <x>==1
PRINT \"one\"
ELIF <x>==2
PRINT \"two\"
ELSE
PRINT \"other\"
END
WHILE <x><10
WRITE <x> (<x> + 1)
END
FOR <i> 0 5
FNCALL step <i>
END
FUNCTION reset
WRITE <x> 0
END
";
        let program = compile(source).unwrap();
        assert_eq!(program.stmts.len(), 4);
        match &program.stmts[0] {
            Stmt::If { arms, else_body } => {
                assert_eq!(arms.len(), 2);
                assert!(else_body.is_some());
            }
            other => panic!("expected if, got {:?}", other),
        }
        assert!(matches!(program.stmts[1], Stmt::While { .. }));
        assert!(matches!(program.stmts[2], Stmt::For { .. }));
        assert!(matches!(program.stmts[3], Stmt::Function { .. }));
    }

    #[test]
    fn unbalanced_blocks_error() {
        let err = compile("IF <x>==1\nPRINT \"ok\"").unwrap_err();
        assert!(matches!(err, CompileError::Syntax { line: 1, .. }));

        let err = compile("END").unwrap_err();
        assert!(matches!(err, CompileError::Syntax { line: 1, .. }));

        let err = compile("WHILE 1\nEND\nELSE\nEND").unwrap_err();
        assert!(matches!(err, CompileError::Syntax { line: 3, .. }));
    }

    #[test]
    fn break_requires_an_enclosing_loop() {
        assert!(compile("WHILE 1\nBREAK\nEND").is_ok());
        assert!(compile("FOR <i> 0 3\nCONTINUE\nEND").is_ok());
        assert!(compile("BREAK").is_err());
        // a function boundary hides the outer loop
        assert!(compile("WHILE 1\nFUNCTION f\nBREAK\nEND\nEND").is_err());
    }

    #[test]
    fn wrong_argument_counts_error() {
        assert!(compile("WRITE <x>").is_err());
        assert!(compile("STOPSIM 1").is_err());
        assert!(compile("CMOVE 1 2").is_err());
        assert!(compile("CMOVE 1 2 3 4").is_ok());
    }

    #[test]
    fn unknown_instruction_errors() {
        let err = compile("EXPLODE").unwrap_err();
        match err {
            CompileError::Syntax { line, message } => {
                assert_eq!(line, 1);
                assert!(message.contains("EXPLODE"));
            }
            other => panic!("wrong error: {:?}", other),
        }
    }

    #[test]
    fn operator_lowering() {
        let program = compile("WRITE <x> (2 ^ 3)").unwrap();
        match &program.stmts[0] {
            Stmt::Call { args, .. } => {
                assert_eq!(
                    args[1],
                    Expr::Binary(BinOp::Pow, Box::new(Expr::Num(2.0)), Box::new(Expr::Num(3.0)))
                );
            }
            other => panic!("wrong stmt: {:?}", other),
        }

        let program = compile("WRITE <x> ~=(<y> / 2)").unwrap();
        match &program.stmts[0] {
            Stmt::Call { args, .. } => {
                assert!(matches!(args[1], Expr::Unary(UnaryOp::Round, _)));
            }
            other => panic!("wrong stmt: {:?}", other),
        }
    }

    #[test]
    fn misplaced_operator_errors() {
        let err = compile("WRITE <x> (* 2)").unwrap_err();
        match err {
            CompileError::Syntax { message, .. } => assert!(message.contains("misplaced")),
            other => panic!("wrong error: {:?}", other),
        }
    }
}
