//! The toy instruction set: tagged variants, a one-shot parser, and the
//! random-program generator.
//!
//! Programs are parsed exactly once, at submission; execution never re-parses
//! strings. Arithmetic saturates into the 16-bit word range.

use serde::{Deserialize, Serialize};

use crate::rng::SimRng;

/// Maximum instruction count for user-supplied programs.
pub const MAX_USER_INSTRUCTIONS: usize = 50;

/// Repeat cap applied to `FOR` counts.
pub const MAX_LOOP_REPEATS: u16 = 1000;

/// Maximum `FOR` nesting depth.
pub const MAX_LOOP_DEPTH: usize = 3;

/// A value-position token: an immediate word or a variable reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// Immediate, already clamped to the word range.
    Lit(u16),
    /// Named variable; undeclared names read as 0.
    Var(String),
}

/// One piece of a `PRINT` expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrintPiece {
    /// Quoted literal, emitted verbatim.
    Literal(String),
    /// Operand rendered as decimal.
    Value(Operand),
}

/// One instruction of the toy ISA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instr {
    /// Allocate a variable and set it to `value` (default 0).
    Declare {
        /// Variable name.
        var: String,
        /// Initial value, if given.
        value: Option<u16>,
    },
    /// `dst <- clamp(lhs + rhs)` when `dst` is declared.
    Add {
        /// Destination variable.
        dst: String,
        /// Left operand.
        lhs: Operand,
        /// Right operand.
        rhs: Operand,
    },
    /// `dst <- clamp(lhs - rhs)` when `dst` is declared.
    Sub {
        /// Destination variable.
        dst: String,
        /// Left operand.
        lhs: Operand,
        /// Right operand.
        rhs: Operand,
    },
    /// Append a formatted line to the process log.
    Print {
        /// Expression pieces, concatenated.
        pieces: Vec<PrintPiece>,
    },
    /// Block the process until the global tick reaches `now + ticks`.
    Sleep {
        /// Tick count to sleep for.
        ticks: u64,
    },
    /// Open a loop running the body `repeats` times (capped).
    For {
        /// Repeat count.
        repeats: Operand,
    },
    /// Close the innermost loop.
    End,
    /// Read the word at `addr` into variable `var` (declared on demand).
    Read {
        /// Destination variable.
        var: String,
        /// Logical byte address.
        addr: u32,
    },
    /// Write the resolved `expr` to the word at `addr`.
    Write {
        /// Logical byte address.
        addr: u32,
        /// Value to store.
        expr: Operand,
    },
}

/// Errors from parsing a user-supplied program.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The program had no instructions.
    #[error("program contains no instructions")]
    Empty,
    /// The program exceeded [`MAX_USER_INSTRUCTIONS`].
    #[error("program has {0} instructions, limit is {MAX_USER_INSTRUCTIONS}")]
    TooManyInstructions(usize),
    /// The first token was not a known opcode.
    #[error("unknown opcode '{0}'")]
    UnknownOpcode(String),
    /// Wrong number of arguments for an opcode.
    #[error("{opcode} expects {expected}")]
    BadArity {
        /// Offending opcode.
        opcode: &'static str,
        /// Expected argument shape.
        expected: &'static str,
    },
    /// A numeric argument failed to parse.
    #[error("invalid numeric value '{0}'")]
    BadValue(String),
    /// An address argument was not hexadecimal.
    #[error("invalid address '{0}'")]
    BadAddress(String),
    /// A `PRINT` expression had an unterminated quote.
    #[error("unbalanced quotes in PRINT expression")]
    UnbalancedQuotes,
    /// `PRINT` was missing its parenthesized argument.
    #[error("PRINT expects a single parenthesized argument")]
    MissingParens,
}

/// Saturate a signed intermediate into the 16-bit word range.
#[must_use]
pub fn clamp_word(value: i64) -> u16 {
    value.clamp(0, i64::from(u16::MAX)) as u16
}

/// Parse a semicolon-separated program.
///
/// # Errors
///
/// Returns a [`ParseError`] on any malformed statement, or when the
/// instruction count is outside `1..=`[`MAX_USER_INSTRUCTIONS`].
pub fn parse_program(source: &str) -> Result<Vec<Instr>, ParseError> {
    let mut program = Vec::new();
    for stmt in source.split(';') {
        let stmt = stmt.trim();
        if stmt.is_empty() {
            continue;
        }
        program.push(parse_statement(stmt)?);
    }
    if program.is_empty() {
        return Err(ParseError::Empty);
    }
    if program.len() > MAX_USER_INSTRUCTIONS {
        return Err(ParseError::TooManyInstructions(program.len()));
    }
    Ok(program)
}

fn parse_statement(stmt: &str) -> Result<Instr, ParseError> {
    if let Some(rest) = stmt.strip_prefix("PRINT") {
        let rest = rest.trim();
        let inner = rest
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .ok_or(ParseError::MissingParens)?;
        return Ok(Instr::Print {
            pieces: parse_print_expr(inner)?,
        });
    }

    let mut tokens = stmt.split_whitespace();
    let opcode = tokens.next().ok_or(ParseError::Empty)?;
    let args: Vec<&str> = tokens.collect();
    match opcode {
        "DECLARE" => match args.as_slice() {
            [var] => Ok(Instr::Declare {
                var: (*var).to_string(),
                value: None,
            }),
            [var, value] => Ok(Instr::Declare {
                var: (*var).to_string(),
                value: Some(parse_word(value)?),
            }),
            _ => Err(ParseError::BadArity {
                opcode: "DECLARE",
                expected: "a variable and an optional value",
            }),
        },
        "ADD" | "SUB" => match args.as_slice() {
            [dst, lhs, rhs] => {
                let dst = (*dst).to_string();
                let lhs = parse_operand(lhs)?;
                let rhs = parse_operand(rhs)?;
                Ok(if opcode == "ADD" {
                    Instr::Add { dst, lhs, rhs }
                } else {
                    Instr::Sub { dst, lhs, rhs }
                })
            }
            _ => Err(ParseError::BadArity {
                opcode: "ADD/SUB",
                expected: "a destination and two operands",
            }),
        },
        "SLEEP" => match args.as_slice() {
            [ticks] => Ok(Instr::Sleep {
                ticks: ticks
                    .parse()
                    .map_err(|_| ParseError::BadValue((*ticks).to_string()))?,
            }),
            _ => Err(ParseError::BadArity {
                opcode: "SLEEP",
                expected: "a tick count",
            }),
        },
        "FOR" => match args.as_slice() {
            [repeats] => Ok(Instr::For {
                repeats: parse_operand(repeats)?,
            }),
            _ => Err(ParseError::BadArity {
                opcode: "FOR",
                expected: "a repeat count",
            }),
        },
        "END" => {
            if args.is_empty() {
                Ok(Instr::End)
            } else {
                Err(ParseError::BadArity {
                    opcode: "END",
                    expected: "no arguments",
                })
            }
        }
        "READ" => match args.as_slice() {
            [var, addr] => Ok(Instr::Read {
                var: (*var).to_string(),
                addr: parse_address(addr)?,
            }),
            _ => Err(ParseError::BadArity {
                opcode: "READ",
                expected: "a variable and an address",
            }),
        },
        "WRITE" => match args.as_slice() {
            [addr, expr] => Ok(Instr::Write {
                addr: parse_address(addr)?,
                expr: parse_operand(expr)?,
            }),
            _ => Err(ParseError::BadArity {
                opcode: "WRITE",
                expected: "an address and a value",
            }),
        },
        other => Err(ParseError::UnknownOpcode(other.to_string())),
    }
}

fn parse_operand(token: &str) -> Result<Operand, ParseError> {
    let numeric = token.starts_with(|c: char| c.is_ascii_digit())
        || (token.starts_with('-') && token.len() > 1);
    if numeric {
        Ok(Operand::Lit(parse_word(token)?))
    } else {
        Ok(Operand::Var(token.to_string()))
    }
}

fn parse_word(token: &str) -> Result<u16, ParseError> {
    token
        .parse::<i64>()
        .map(clamp_word)
        .map_err(|_| ParseError::BadValue(token.to_string()))
}

fn parse_address(token: &str) -> Result<u32, ParseError> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u32::from_str_radix(digits, 16).map_err(|_| ParseError::BadAddress(token.to_string()))
}

/// Split a `PRINT` expression on `+`, honoring quotes first so literals may
/// contain `+`.
fn parse_print_expr(expr: &str) -> Result<Vec<PrintPiece>, ParseError> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in expr.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '+' if !in_quotes => {
                pieces.push(finish_print_piece(&current)?);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if in_quotes {
        return Err(ParseError::UnbalancedQuotes);
    }
    pieces.push(finish_print_piece(&current)?);
    Ok(pieces)
}

fn finish_print_piece(raw: &str) -> Result<PrintPiece, ParseError> {
    let token = raw.trim();
    if token.is_empty() {
        return Err(ParseError::BadValue(raw.to_string()));
    }
    if let Some(inner) = token.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        return Ok(PrintPiece::Literal(inner.to_string()));
    }
    Ok(PrintPiece::Value(parse_operand(token)?))
}

// ---- random program generation ----

const VAR_POOL: [&str; 6] = ["x", "y", "z", "a", "b", "c"];
const FOR_PROBABILITY: f64 = 0.15;
const END_BIAS: f64 = 0.25;

/// Generate a random program of `min_ins..=max_ins` instructions.
///
/// Follows the classic workload shape: five simple opcodes, occasional
/// bounded `FOR` blocks nested at most [`MAX_LOOP_DEPTH`] deep, and always
/// balanced `FOR`/`END` pairs.
pub fn generate_program(
    rng: &mut SimRng,
    min_ins: u64,
    max_ins: u64,
    proc_name: &str,
) -> Vec<Instr> {
    let total = rng.pick(min_ins..=max_ins.max(min_ins)) as usize;
    let mut program = Vec::with_capacity(total);
    let mut open_loops = 0usize;

    while program.len() < total {
        let remaining = total - program.len();
        // Close loops in time to stay inside the budget.
        if open_loops > 0 && (remaining <= open_loops || rng.chance(END_BIAS)) {
            program.push(Instr::End);
            open_loops -= 1;
            continue;
        }
        // A FOR needs room for itself, one body instruction, and its END.
        if open_loops < MAX_LOOP_DEPTH && remaining >= 3 && rng.chance(FOR_PROBABILITY) {
            program.push(Instr::For {
                repeats: Operand::Lit(rng.pick(1..=5u16)),
            });
            open_loops += 1;
            continue;
        }
        program.push(random_simple(rng, proc_name));
    }
    program
}

fn random_simple(rng: &mut SimRng, proc_name: &str) -> Instr {
    match rng.pick(0..5u8) {
        0 => Instr::Declare {
            var: random_var(rng),
            value: rng.chance(0.5).then(|| rng.pick(0..=1000u16)),
        },
        1 => Instr::Add {
            dst: random_var(rng),
            lhs: Operand::Var(random_var(rng)),
            rhs: Operand::Lit(rng.pick(0..=100u16)),
        },
        2 => Instr::Sub {
            dst: random_var(rng),
            lhs: Operand::Var(random_var(rng)),
            rhs: Operand::Lit(rng.pick(0..=100u16)),
        },
        3 => Instr::Print {
            pieces: vec![PrintPiece::Literal(format!("Hello world from {proc_name}!"))],
        },
        _ => Instr::Sleep {
            ticks: u64::from(rng.pick(1..=10u8)),
        },
    }
}

fn random_var(rng: &mut SimRng) -> String {
    VAR_POOL[rng.pick(0..VAR_POOL.len())].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_declare_and_arith() {
        let prog = parse_program("DECLARE x 5; ADD x x 3; SUB y x 2").unwrap();
        assert_eq!(prog.len(), 3);
        assert_matches!(&prog[0], Instr::Declare { var, value: Some(5) } if var == "x");
        assert_matches!(
            &prog[1],
            Instr::Add { dst, lhs: Operand::Var(l), rhs: Operand::Lit(3) }
                if dst == "x" && l == "x"
        );
    }

    #[test]
    fn test_parse_print_with_plus_inside_quotes() {
        let prog = parse_program("PRINT(\"a+b=\" + x)").unwrap();
        assert_matches!(&prog[0], Instr::Print { pieces } => {
            assert_eq!(pieces.len(), 2);
            assert_eq!(pieces[0], PrintPiece::Literal("a+b=".to_string()));
            assert_eq!(pieces[1], PrintPiece::Value(Operand::Var("x".to_string())));
        });
    }

    #[test]
    fn test_parse_unbalanced_quotes_rejected() {
        assert_matches!(
            parse_program("PRINT(\"oops)"),
            Err(ParseError::UnbalancedQuotes | ParseError::MissingParens)
        );
    }

    #[test]
    fn test_parse_addresses() {
        let prog = parse_program("WRITE 0x80 42; READ v 1F").unwrap();
        assert_matches!(&prog[0], Instr::Write { addr: 0x80, expr: Operand::Lit(42) });
        assert_matches!(&prog[1], Instr::Read { var, addr: 0x1F } if var == "v");
        assert_matches!(
            parse_program("WRITE zz 1"),
            Err(ParseError::BadAddress(_))
        );
    }

    #[test]
    fn test_parse_count_limits() {
        assert_matches!(parse_program("  ; ; "), Err(ParseError::Empty));
        let long = vec!["END"; MAX_USER_INSTRUCTIONS + 1].join("; ");
        assert_matches!(
            parse_program(&long),
            Err(ParseError::TooManyInstructions(_))
        );
    }

    #[test]
    fn test_parse_unknown_opcode() {
        assert_matches!(parse_program("JMP 3"), Err(ParseError::UnknownOpcode(op)) if op == "JMP");
    }

    #[test]
    fn test_negative_literal_clamps_to_zero() {
        let prog = parse_program("DECLARE x -7").unwrap();
        assert_matches!(&prog[0], Instr::Declare { value: Some(0), .. });
    }

    #[test]
    fn test_clamp_word_saturates() {
        assert_eq!(clamp_word(-1), 0);
        assert_eq!(clamp_word(0), 0);
        assert_eq!(clamp_word(65_535), u16::MAX);
        assert_eq!(clamp_word(70_000), u16::MAX);
    }

    #[test]
    fn test_generated_programs_are_balanced_and_sized() {
        let mut rng = SimRng::new(11);
        for _ in 0..50 {
            let prog = generate_program(&mut rng, 5, 40, "p1");
            assert!(prog.len() >= 5 && prog.len() <= 40);
            let mut depth = 0usize;
            for ins in &prog {
                match ins {
                    Instr::For { .. } => {
                        depth += 1;
                        assert!(depth <= MAX_LOOP_DEPTH);
                    }
                    Instr::End => {
                        depth = depth.checked_sub(1).expect("END without FOR generated");
                    }
                    _ => {}
                }
            }
            assert_eq!(depth, 0, "unbalanced FOR/END");
        }
    }

    #[test]
    fn test_generation_is_seed_deterministic() {
        let a = generate_program(&mut SimRng::new(99), 10, 30, "p2");
        let b = generate_program(&mut SimRng::new(99), 10, 30, "p2");
        assert_eq!(a, b);
    }

    proptest::proptest! {
        #[test]
        fn prop_clamp_word_stays_in_range(value in proptest::num::i64::ANY) {
            let clamped = i64::from(clamp_word(value));
            proptest::prop_assert!((0..=i64::from(u16::MAX)).contains(&clamped));
            if (0..=i64::from(u16::MAX)).contains(&value) {
                proptest::prop_assert_eq!(clamped, value);
            }
        }
    }
}
