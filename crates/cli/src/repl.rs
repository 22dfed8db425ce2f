//! Interactive REPL.
//!
//! Input accumulates until the parser accepts the buffer: while parse
//! errors still mention the end of the file, the block is unfinished and
//! the prompt switches to a continuation prompt. A line that parses to a
//! single bare expression is wrapped in `print(…)` before execution.
//! Globals (and compiler session state) persist across lines.

use noxy_compiler::ast::{Expr, ExprKind, Stmt, StmtKind};
use noxy_compiler::{compile, Parser};
use noxy_runtime::{base_session, FileModuleLoader, Vm};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const PROMPT: &str = ">> ";
const CONTINUE_PROMPT: &str = ".. ";

pub fn run() -> i32 {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("error: could not start line editor: {}", e);
            return 1;
        }
    };

    println!("noxy {} - type 'exit' to leave", env!("CARGO_PKG_VERSION"));

    let mut vm = Vm::new();
    vm.loader = Some(FileModuleLoader::for_script(None));
    let mut session = base_session();
    let mut buffer = String::new();

    loop {
        let prompt = if buffer.is_empty() {
            PROMPT
        } else {
            CONTINUE_PROMPT
        };
        match editor.readline(prompt) {
            Ok(line) => {
                if buffer.is_empty() && line.trim() == "exit" {
                    break;
                }
                buffer.push_str(&line);
                buffer.push('\n');

                match Parser::new(&buffer).parse() {
                    Err(errors) if continues(&errors) => {
                        // The block is unfinished; keep reading lines.
                    }
                    Err(errors) => {
                        let _ = editor.add_history_entry(buffer.trim());
                        for error in errors {
                            eprintln!("{}", error);
                        }
                        buffer.clear();
                    }
                    Ok(program) => {
                        let _ = editor.add_history_entry(buffer.trim());
                        let program = wrap_bare_expression(program);
                        match compile(&program, &mut session, None) {
                            Ok(script) => {
                                if let Err(err) = vm.interpret(script) {
                                    eprintln!("{}", err);
                                }
                            }
                            Err(err) => eprintln!("{}", err),
                        }
                        buffer.clear();
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                buffer.clear();
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("error: {}", e);
                return 1;
            }
        }
    }

    vm.routines.wait_all();
    0
}

/// Unfinished multi-line input shows up as a parse error mentioning the
/// end of the file.
fn continues(errors: &[noxy_compiler::ParseError]) -> bool {
    errors.iter().any(|e| e.message.contains("end of file"))
}

/// Wrap a single bare expression in `print(…)` so evaluating `1 + 2`
/// shows its value. Statements and explicit print calls pass through.
fn wrap_bare_expression(mut program: Vec<Stmt>) -> Vec<Stmt> {
    if program.len() != 1 {
        return program;
    }
    let is_bare = match &program[0].kind {
        StmtKind::Expr(expr) => !is_print_call(expr),
        _ => false,
    };
    if !is_bare {
        return program;
    }
    let stmt = program.pop().expect("checked length above");
    let StmtKind::Expr(expr) = stmt.kind else {
        unreachable!("checked shape above");
    };
    let (line, col) = (expr.line, expr.col);
    vec![Stmt::new(
        StmtKind::Expr(Expr::new(
            ExprKind::Call {
                callee: Box::new(Expr::new(
                    ExprKind::Ident("print".to_string()),
                    line,
                    col,
                )),
                args: vec![expr],
            },
            line,
            col,
        )),
        stmt.line,
    )]
}

fn is_print_call(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Call { callee, .. } => {
            matches!(&callee.kind, ExprKind::Ident(name) if name == "print")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Vec<Stmt> {
        Parser::new(source).parse().expect("parse failed")
    }

    #[test]
    fn test_bare_expression_is_wrapped() {
        let program = wrap_bare_expression(parse("1 + 2\n"));
        let StmtKind::Expr(expr) = &program[0].kind else {
            panic!("expected expression statement");
        };
        assert!(is_print_call(expr));
    }

    #[test]
    fn test_statement_is_not_wrapped() {
        let program = wrap_bare_expression(parse("let x: int = 1\n"));
        assert!(matches!(program[0].kind, StmtKind::Let { .. }));
    }

    #[test]
    fn test_print_call_is_not_double_wrapped() {
        let program = wrap_bare_expression(parse("print(1)\n"));
        let StmtKind::Expr(expr) = &program[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Call { args, .. } = &expr.kind else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 1);
        assert!(matches!(args[0].kind, ExprKind::Int(1)));
    }

    #[test]
    fn test_unfinished_block_continues() {
        let errors = Parser::new("while true do\n").parse().unwrap_err();
        assert!(continues(&errors));
        let errors = Parser::new("let x = 1\n").parse().unwrap_err();
        assert!(!continues(&errors));
    }
}
