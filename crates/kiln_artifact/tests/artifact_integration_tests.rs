//! Integration tests for streaming parse and tree projection.

use kiln_artifact::{
    build_file_tree, find_file_by_path, find_first_file, walk, ArtifactParser, StepKind,
};

const RESPONSE: &str = r#"I'll build a counter app.

<artifact title="Counter App">
<action type="file" path="package.json">
{
  "name": "counter",
  "scripts": { "dev": "vite" }
}
</action>
<action type="shell">
npm install
</action>
<action type="file" path="src/main.tsx">
import { render } from "react-dom";
render(<App />, document.getElementById("root"));
</action>
<action type="file" path="src/App.tsx">
export default function App() { return <button>+1</button>; }
</action>
</artifact>

Run `npm run dev` to start."#;

/// Feed the response in fixed-size chunks, checking invariants after each one.
#[test]
fn test_streamed_response_builds_consistent_tree() {
    let mut parser = ArtifactParser::new();
    let mut previous_paths: Vec<String> = Vec::new();

    let chars: Vec<char> = RESPONSE.chars().collect();
    for chunk in chars.chunks(7) {
        let chunk: String = chunk.iter().collect();
        let steps = parser.push(&chunk);
        let tree = build_file_tree(&steps);

        let paths: Vec<String> = walk(&tree).map(|n| n.path.clone()).collect();
        for path in &previous_paths {
            assert!(paths.contains(path), "{} disappeared", path);
        }
        previous_paths = paths;

        let pending = steps.iter().filter(|s| s.is_pending()).count();
        assert!(pending <= 1);
    }

    let steps = parser.steps();
    let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![
            StepKind::ProjectInit,
            StepKind::CreateFile,
            StepKind::RunCommand,
            StepKind::CreateFile,
            StepKind::CreateFile,
        ]
    );
    assert!(steps.iter().all(|s| s.is_completed()));
    assert_eq!(steps[0].title, "Counter App");
    assert_eq!(steps[2].code, "npm install");

    let tree = build_file_tree(&steps);
    assert_eq!(find_first_file(&tree).unwrap().path, "package.json");
    let app = find_file_by_path(&tree, "src/App.tsx").unwrap();
    assert!(app.content_str().starts_with("export default function App()"));
    assert!(find_file_by_path(&tree, "npm install").is_none());
}

/// Text after the artifact closes never becomes a step.
#[test]
fn test_trailing_prose_ignored() {
    let mut parser = ArtifactParser::new();
    parser.push(RESPONSE);
    let before = parser.steps();
    parser.push("\n<action type=\"file\" path=\"late.txt\">late</action>");
    assert_eq!(parser.steps(), before);
}
