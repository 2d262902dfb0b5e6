//! Self-critique prompt and response parsing.
//!
//! The critique prompt asks the model to grade its own work on three 1-3
//! criteria and either list concrete improvements or answer `DONE`. Parsing
//! is lenient inside the loop ([`parse_critique`]) and strict elsewhere
//! ([`parse_score`]).

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ScoreError;

const MIN_SCORE: u32 = 1;
const MAX_SCORE: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RubricScore {
    pub correctness: u32,
    pub readability: u32,
    pub edge_cases: u32,
}

impl RubricScore {
    pub fn new(correctness: u32, readability: u32, edge_cases: u32) -> Result<Self, ScoreError> {
        check_range("CORRECTNESS", correctness)?;
        check_range("READABILITY", readability)?;
        check_range("EDGE_CASES", edge_cases)?;
        Ok(Self {
            correctness,
            readability,
            edge_cases,
        })
    }

    pub fn total(&self) -> u32 {
        self.correctness + self.readability + self.edge_cases
    }

    pub fn is_valid(&self) -> bool {
        [self.correctness, self.readability, self.edge_cases]
            .iter()
            .all(|v| (MIN_SCORE..=MAX_SCORE).contains(v))
    }

    pub fn meets(&self, threshold: u32) -> bool {
        self.total() >= threshold
    }

    /// The block [`parse_score`] reads back.
    pub fn render(&self) -> String {
        format!(
            "CORRECTNESS: {}\nREADABILITY: {}\nEDGE_CASES: {}\nTotal: {}/9",
            self.correctness,
            self.readability,
            self.edge_cases,
            self.total()
        )
    }
}

fn check_range(field: &'static str, value: u32) -> Result<(), ScoreError> {
    if (MIN_SCORE..=MAX_SCORE).contains(&value) {
        Ok(())
    } else {
        Err(ScoreError::ScoreOutOfRange { field, value })
    }
}

/// Rubric questions as they appear in the prompt. Echoed copies are not
/// improvements.
const RUBRIC_QUESTIONS: [&str; 3] = [
    "CORRECTNESS: Does the code do what the task asks, without bugs?",
    "READABILITY: Is the code clear, idiomatic and consistent with the codebase?",
    "EDGE_CASES: Are error paths, empty inputs and boundaries handled?",
];

/// Critique prompt bound to a tier threshold.
#[derive(Clone, Debug)]
pub struct CritiquePrompt {
    threshold: u32,
}

impl CritiquePrompt {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn template(&self) -> String {
        let questions: String = RUBRIC_QUESTIONS.iter().map(|q| format!("- {q}\n")).collect();
        format!(
            "## Self-Critique\n\n\
             Review the work above. Score each criterion from 1 (poor) to 3 (excellent):\n\n\
             {questions}\n\
             Respond with one line per criterion, e.g. `CORRECTNESS: 2`, then `Total: X/9`.\n\
             The passing total is {threshold}/9.\n\n\
             If the work meets the bar and nothing important remains, reply with the single word DONE.\n\
             Otherwise list specific improvements as bullet points and make them.\n",
            threshold = self.threshold
        )
    }

    /// `output` followed by the critique template.
    pub fn build(&self, output: &str) -> String {
        format!("{}\n\n{}", output.trim_end(), self.template())
    }
}

/// Parsed critique response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CritiqueResult {
    pub score: Option<RubricScore>,
    pub is_done: bool,
    pub improvements: Vec<String>,
}

static DONE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bDONE\b").unwrap());
static CORRECTNESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bCORRECTNESS\b\W{0,4}(\d+)").unwrap());
static READABILITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bREADABILITY\b\W{0,4}(\d+)").unwrap());
static EDGE_CASES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bEDGE[_ ]CASES\b\W{0,4}(\d+)").unwrap());
static TOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bTOTAL\b\W{0,4}(\d+)\s*/\s*9").unwrap());
static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s+(.+?)\s*$").unwrap());

fn capture(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

fn in_range(v: Option<u32>) -> Option<u32> {
    v.filter(|v| (MIN_SCORE..=MAX_SCORE).contains(v))
}

/// Lenient parse used inside the critique loop.
///
/// Out-of-range values are ignored and a partial score yields `None`. The
/// only hard failure is a `Total: X/9` line that disagrees with the
/// individual scores.
pub fn parse_critique(text: &str) -> Result<CritiqueResult, ScoreError> {
    let correctness = in_range(capture(&CORRECTNESS, text));
    let readability = in_range(capture(&READABILITY, text));
    let edge_cases = in_range(capture(&EDGE_CASES, text));

    let found: u32 = [correctness, readability, edge_cases].iter().flatten().sum();
    if let Some(total) = capture(&TOTAL, text) {
        if found > 0 && found != total {
            return Err(ScoreError::MalformedResponse(format!(
                "scores sum to {found} but total says {total}"
            )));
        }
    }

    let score = match (correctness, readability, edge_cases) {
        (Some(c), Some(r), Some(e)) => Some(RubricScore {
            correctness: c,
            readability: r,
            edge_cases: e,
        }),
        _ => None,
    };

    let improvements = text
        .lines()
        .filter_map(|line| BULLET.captures(line))
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|item| !RUBRIC_QUESTIONS.contains(&item.as_str()))
        .collect();

    Ok(CritiqueResult {
        score,
        is_done: DONE.is_match(text),
        improvements,
    })
}

/// Strict parse: all three scores must be present and in range.
pub fn parse_score(text: &str) -> Result<RubricScore, ScoreError> {
    let correctness = capture(&CORRECTNESS, text);
    let readability = capture(&READABILITY, text);
    let edge_cases = capture(&EDGE_CASES, text);

    if correctness.is_none() && readability.is_none() && edge_cases.is_none() {
        return Err(ScoreError::MalformedResponse("no rubric scores found".into()));
    }
    let correctness = correctness.ok_or(ScoreError::MissingScore("CORRECTNESS"))?;
    let readability = readability.ok_or(ScoreError::MissingScore("READABILITY"))?;
    let edge_cases = edge_cases.ok_or(ScoreError::MissingScore("EDGE_CASES"))?;
    let score = RubricScore::new(correctness, readability, edge_cases)?;

    if let Some(total) = capture(&TOTAL, text) {
        if total != score.total() {
            return Err(ScoreError::MalformedResponse(format!(
                "scores sum to {} but total says {total}",
                score.total()
            )));
        }
    }
    Ok(score)
}
