use crate::vector::TestVector;

/// The fixed harness skeleton: the `__VERIFIER_nondet_*` family, each
/// definition pulling its next token from the `get_input()` hook.
const SKELETON: &str = include_str!("harness_skeleton.c");

/// Diagnostic printed by an embedded-vector harness when the program
/// requests more values than the vector supplies.
pub const INCOMPLETE_VECTOR_MESSAGE: &str = "Incomplete test vector, aborting";

/// The external-symbol table: input functions a target program is expected
/// to declare, with the canonical `extern` declaration emitted when the
/// program does not declare one itself.
pub const INPUT_FUNCTIONS: &[(&str, &str)] = &[
    ("__VERIFIER_nondet_int", "extern int __VERIFIER_nondet_int(void);"),
    (
        "__VERIFIER_nondet_uint",
        "extern unsigned int __VERIFIER_nondet_uint(void);",
    ),
    (
        "__VERIFIER_nondet_long",
        "extern long __VERIFIER_nondet_long(void);",
    ),
    (
        "__VERIFIER_nondet_ulong",
        "extern unsigned long __VERIFIER_nondet_ulong(void);",
    ),
    (
        "__VERIFIER_nondet_short",
        "extern short __VERIFIER_nondet_short(void);",
    ),
    (
        "__VERIFIER_nondet_ushort",
        "extern unsigned short __VERIFIER_nondet_ushort(void);",
    ),
    (
        "__VERIFIER_nondet_char",
        "extern char __VERIFIER_nondet_char(void);",
    ),
    (
        "__VERIFIER_nondet_uchar",
        "extern unsigned char __VERIFIER_nondet_uchar(void);",
    ),
    (
        "__VERIFIER_nondet_bool",
        "extern _Bool __VERIFIER_nondet_bool(void);",
    ),
    (
        "__VERIFIER_nondet_float",
        "extern float __VERIFIER_nondet_float(void);",
    ),
    (
        "__VERIFIER_nondet_double",
        "extern double __VERIFIER_nondet_double(void);",
    ),
];

/// Synthesizes a compilable harness body for `program_source`.
///
/// The harness consists of `extern` declarations for the expected input
/// symbols the program does not already declare, the fixed skeleton, and
/// exactly one `get_input()` implementation: values embedded from `vector`
/// when one is given, otherwise a line-per-call stdin reader.
///
/// Pure text synthesis; the caller decides where to write the result.
pub fn synthesize(program_source: &str, vector: Option<&TestVector>) -> String {
    let mut harness = String::new();
    for (symbol, declaration) in INPUT_FUNCTIONS {
        if !declares_symbol(program_source, symbol) {
            harness.push_str(declaration);
            harness.push('\n');
        }
    }
    harness.push('\n');
    harness.push_str(SKELETON);
    harness.push('\n');
    match vector {
        Some(vector) => harness.push_str(&embedded_input_fn(vector)),
        None => harness.push_str(STDIN_INPUT_FN),
    }
    harness
}

/// Whether the program already declares `symbol`.
///
/// The scan is naive and textual: only the region before the first include
/// directive is considered, since declarations past an include cannot be
/// told apart from header text without preprocessing. When the source opens
/// with an include, the fallback scans whole lines for statement-prefix
/// markers instead.
fn declares_symbol(program_source: &str, symbol: &str) -> bool {
    match program_source.find("#include") {
        None => program_source.contains(symbol),
        Some(0) => statement_prefix_scan(program_source, symbol),
        Some(pos) => program_source[..pos].contains(symbol),
    }
}

const DECL_PREFIXES: &[&str] = &[
    "extern", "int", "unsigned", "signed", "long", "short", "char", "float", "double", "_Bool",
    "void",
];

fn statement_prefix_scan(program_source: &str, symbol: &str) -> bool {
    program_source.lines().any(|line| {
        let trimmed = line.trim_start();
        if !trimmed.contains(symbol) {
            return false;
        }
        trimmed.starts_with(symbol)
            || DECL_PREFIXES
                .iter()
                .any(|prefix| trimmed.starts_with(prefix))
    })
}

/// Escapes a value for embedding in a C string literal, so a C lexer
/// reproduces the original exactly.
fn escape_c_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn embedded_input_fn(vector: &TestVector) -> String {
    let mut body = String::from(
        "char * get_input(void) {\n    static unsigned int access_counter = 0;\n    switch (access_counter++) {\n",
    );
    for (index, value) in vector.values.iter().enumerate() {
        body.push_str(&format!(
            "        case {index}: return \"{}\";\n",
            escape_c_string(value)
        ));
    }
    body.push_str(&format!(
        "        default:\n            fprintf(stderr, \"{INCOMPLETE_VECTOR_MESSAGE}\\n\");\n            exit(1);\n    }}\n}}\n"
    ));
    body
}

const STDIN_INPUT_FN: &str = "char * get_input(void) {
    static char input_line[8192];
    if (fgets(input_line, sizeof(input_line), stdin) == NULL) {
        fprintf(stderr, \"No input left on stdin, aborting\\n\");
        exit(1);
    }
    size_t input_len = strlen(input_line);
    if (input_len > 0 && input_line[input_len - 1] == '\\n') {
        input_line[input_len - 1] = '\\0';
    }
    return input_line;
}
";

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(values: &[&str]) -> TestVector {
        TestVector::new(
            "t",
            "t.xml",
            values.iter().map(|v| v.to_string()).collect(),
        )
    }

    /// Minimal C string literal reader: the inverse of `escape_c_string`.
    fn unescape_c_string(literal: &str) -> String {
        let mut out = String::new();
        let mut chars = literal.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    #[test]
    fn declarations_emitted_only_for_missing_symbols() {
        let program = "extern int __VERIFIER_nondet_int(void);\n#include <stdio.h>\nint main(void) { return __VERIFIER_nondet_int(); }\n";
        let harness = synthesize(program, None);
        assert!(
            !harness.starts_with("extern int __VERIFIER_nondet_int"),
            "declared symbol must not be redeclared"
        );
        assert!(
            harness.contains("extern unsigned int __VERIFIER_nondet_uint(void);"),
            "undeclared symbols get extern declarations"
        );
    }

    #[test]
    fn include_first_source_uses_statement_prefix_scan() {
        let program =
            "#include <stdio.h>\nint __VERIFIER_nondet_int(void);\nint main(void) { return 0; }\n";
        let harness = synthesize(program, None);
        assert!(
            !harness.contains("extern int __VERIFIER_nondet_int(void);"),
            "statement-prefix declaration after an include must be detected"
        );
    }

    #[test]
    fn source_without_includes_scans_whole_text() {
        let program = "long __VERIFIER_nondet_long(void);\nint main(void) { return 0; }\n";
        let harness = synthesize(program, None);
        assert!(!harness.contains("extern long __VERIFIER_nondet_long(void);"));
        assert!(harness.contains("extern int __VERIFIER_nondet_int(void);"));
    }

    #[test]
    fn embedded_harness_supplies_values_in_order() {
        let harness = synthesize("int main(void) { return 0; }", Some(&vector(&["5", "7"])));
        let case0 = harness.find("case 0: return \"5\";").expect("first value");
        let case1 = harness.find("case 1: return \"7\";").expect("second value");
        assert!(case0 < case1, "values must appear in declaration order");
        assert!(
            harness.contains(INCOMPLETE_VECTOR_MESSAGE),
            "over-consumption must hit the abort diagnostic"
        );
        assert!(harness.contains("exit(1);"));
    }

    #[test]
    fn empty_vector_harness_aborts_on_first_request() {
        let harness = synthesize("int main(void) { return 0; }", Some(&vector(&[])));
        assert!(!harness.contains("case 0:"), "no values, no cases");
        assert!(harness.contains(INCOMPLETE_VECTOR_MESSAGE));
    }

    #[test]
    fn stdin_harness_reads_lines_and_strips_newline() {
        let harness = synthesize("int main(void) { return 0; }", None);
        assert!(harness.contains("fgets(input_line"));
        assert!(harness.contains("input_line[input_len - 1] = '\\0';"));
        assert!(harness.contains("No input left on stdin"));
        assert!(
            !harness.contains("access_counter"),
            "exactly one input-supply implementation"
        );
    }

    #[test]
    fn quote_escaping_round_trips() {
        let tricky = ["plain", "say \"hi\"", "back\\slash", "\\\"both\\\""];
        for value in tricky {
            let escaped = escape_c_string(value);
            assert_eq!(
                unescape_c_string(&escaped),
                value,
                "escaped literal must lex back to the original value"
            );
        }

        let harness = synthesize(
            "int main(void) { return 0; }",
            Some(&vector(&["say \"hi\""])),
        );
        assert!(harness.contains("return \"say \\\"hi\\\"\";"));
    }

    #[test]
    fn skeleton_covers_the_whole_symbol_table() {
        for (symbol, _) in INPUT_FUNCTIONS {
            assert!(
                SKELETON.contains(&format!("{symbol}(void)")),
                "skeleton must define {symbol}"
            );
        }
    }
}
