use pyright_mcp::diagnostics::parse;
use pyright_mcp::model::{RawToolOutput, Severity};
use pyright_mcp::normalize::normalize;
use std::path::Path;

fn output(stdout: &str, exit_code: i32) -> RawToolOutput {
    RawToolOutput {
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
        exit_code: Some(exit_code),
        timed_out: false,
        duration_ms: 12,
    }
}

#[test]
fn parse_pyright_outputjson_document() {
    let stdout = r#"
{
    "version": "1.1.405",
    "time": "1719843256123",
    "generalDiagnostics": [
        {
            "file": "/work/repo/pkg/a.py",
            "severity": "error",
            "message": "\"undefined_name\" is not defined",
            "range": {
                "start": { "line": 9, "character": 4 },
                "end": { "line": 9, "character": 18 }
            },
            "rule": "reportUndefinedVariable"
        },
        {
            "file": "/work/repo/pkg/a.py",
            "severity": "warning",
            "message": "Import \"yaml\" could not be resolved from source",
            "range": {
                "start": { "line": 0, "character": 7 },
                "end": { "line": 0, "character": 11 }
            },
            "rule": "reportMissingModuleSource"
        },
        {
            "file": "/work/repo/pkg/b.py",
            "severity": "information",
            "message": "Code is unreachable",
            "range": {
                "start": { "line": 2, "character": 0 },
                "end": { "line": 2, "character": 8 }
            }
        }
    ],
    "summary": {
        "filesAnalyzed": 2,
        "errorCount": 1,
        "warningCount": 1,
        "informationCount": 1,
        "timeInSec": 0.61
    }
}
"#;
    let parsed = parse(&output(stdout, 1)).unwrap();
    assert_eq!(parsed.diagnostics.len(), 3);
    assert_eq!(parsed.dropped, 0);
    assert!(!parsed.truncated);
    assert_eq!(parsed.files_analyzed, Some(2));

    let root = Path::new("/work/repo");
    let normalized = normalize(parsed.diagnostics, root, root);
    let diags = normalized.diagnostics;
    assert_eq!(diags.len(), 3);

    let first = &diags[0];
    assert_eq!(first.file_path, "pkg/a.py");
    assert_eq!((first.line, first.column), (1, 8));
    assert_eq!(first.severity, Severity::Warning);

    let undefined = &diags[1];
    assert_eq!((undefined.line, undefined.column), (10, 5));
    assert_eq!(undefined.severity, Severity::Error);
    let range = undefined.range.unwrap();
    assert_eq!((range.end_line, range.end_column), (10, 19));
    assert_eq!(undefined.message, "\"undefined_name\" is not defined");

    let info = &diags[2];
    assert_eq!(info.file_path, "pkg/b.py");
    assert_eq!(info.rule, None);
    assert_eq!(info.severity, Severity::Information);
}

#[test]
fn serialized_diagnostic_uses_snake_case_fields() {
    let stdout = r#"{"generalDiagnostics": [{"file": "/r/x.py", "severity": "error", "message": "m",
        "range": {"start": {"line": 0, "character": 0}}}]}"#;
    let parsed = parse(&output(stdout, 1)).unwrap();
    let normalized = normalize(parsed.diagnostics, Path::new("/r"), Path::new("/r"));
    let value = serde_json::to_value(&normalized.diagnostics[0]).unwrap();
    assert_eq!(value["file_path"], "x.py");
    assert_eq!(value["line"], 1);
    assert_eq!(value["column"], 1);
    assert_eq!(value["severity"], "error");
    assert!(value.get("rule").is_none());
    assert!(value.get("range").is_none());
    assert_eq!(value["fingerprint"].as_str().unwrap().len(), 16);
}

#[test]
fn killed_process_with_partial_json_is_not_a_clean_result() {
    let raw = RawToolOutput {
        stdout: br#"{"generalDiagnostics": [{"file": "/r/x.py", "sever"#.to_vec(),
        stderr: Vec::new(),
        exit_code: None,
        timed_out: true,
        duration_ms: 60_000,
    };
    let err = parse(&raw).unwrap_err();
    assert!(err.is_timeout());
}
