//! Turn routing: decide whether the active agent keeps control, hands off to
//! another agent, or finishes the task.
//!
//! Precedence, highest first:
//! 1. Structured directives (reserved tool calls emitted by the agent)
//! 2. Heuristic rules, first declared match wins
//! 3. Completion patterns
//! 4. Otherwise continue with the same agent

use regex::{Regex, RegexBuilder};

use ensemble_core::tools::ToolCallRequest;

/// Reserved tool name: `{"agent": "<name>"}` hands control to that agent.
pub const TRANSFER_DIRECTIVE: &str = "transfer_to_agent";
/// Reserved tool name: marks the task complete.
pub const COMPLETE_DIRECTIVE: &str = "complete_task";

const DEFAULT_COMPLETION_PATTERNS: &[&str] = &[r"\bTASK_COMPLETE\b", r"\btask complete\b"];

/// Machine-emitted routing signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Directive {
    Transfer(String),
    Complete,
    /// A reserved call whose arguments could not be understood.
    Malformed(String),
}

impl Directive {
    /// Interpret a tool call request. `None` for ordinary tools.
    pub fn from_request(request: &ToolCallRequest) -> Option<Self> {
        match request.name.as_str() {
            TRANSFER_DIRECTIVE => Some(
                match request.arguments.get("agent").and_then(|v| v.as_str()) {
                    Some(agent) if !agent.trim().is_empty() => Self::Transfer(agent.trim().to_string()),
                    _ => Self::Malformed(format!(
                        "{TRANSFER_DIRECTIVE} requires a string 'agent' argument, got {}",
                        request.arguments
                    )),
                },
            ),
            COMPLETE_DIRECTIVE => Some(Self::Complete),
            _ => None,
        }
    }
}

/// A `(pattern, destination)` heuristic. Patterns are case-insensitive.
#[derive(Clone, Debug)]
pub struct HandoffRule {
    pattern: Regex,
    destination: String,
}

impl HandoffRule {
    pub fn regex(pattern: &str, destination: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: RegexBuilder::new(pattern).case_insensitive(true).build()?,
            destination: destination.into(),
        })
    }

    /// Match a literal phrase anywhere in the response.
    pub fn phrase(text: &str, destination: impl Into<String>) -> Result<Self, regex::Error> {
        Self::regex(&regex::escape(text), destination)
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteAction {
    Continue,
    Handoff(String),
    Complete,
}

impl RouteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Handoff(_) => "handoff",
            Self::Complete => "complete",
        }
    }

    pub fn destination(&self) -> Option<&str> {
        match self {
            Self::Handoff(dest) => Some(dest),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteMethod {
    Directive,
    /// Index of the winning rule in declaration order.
    Rule(usize),
    CompletionPattern,
    None,
}

impl RouteMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Directive => "directive",
            Self::Rule(_) => "rule",
            Self::CompletionPattern => "completion_pattern",
            Self::None => "none",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingDecision {
    pub action: RouteAction,
    pub method: RouteMethod,
    /// Destinations of other rules that also matched. Non-empty means the
    /// response was ambiguous.
    pub also_matched: Vec<String>,
    /// Directives that were ignored, with the reason.
    pub warnings: Vec<String>,
}

impl RoutingDecision {
    fn new(action: RouteAction, method: RouteMethod) -> Self {
        Self {
            action,
            method,
            also_matched: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        !self.also_matched.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct HandoffRouter {
    rules: Vec<HandoffRule>,
    completion: Vec<Regex>,
}

impl HandoffRouter {
    /// Router with the given rules and the default completion patterns.
    pub fn new(rules: Vec<HandoffRule>) -> Self {
        let completion = DEFAULT_COMPLETION_PATTERNS
            .iter()
            .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
            .collect();
        Self { rules, completion }
    }

    /// Replace the completion pattern set.
    pub fn with_completion_patterns(mut self, patterns: &[&str]) -> Result<Self, regex::Error> {
        self.completion = patterns
            .iter()
            .map(|p| RegexBuilder::new(p).case_insensitive(true).build())
            .collect::<Result<_, _>>()?;
        Ok(self)
    }

    /// Decide where control goes after a finished turn.
    ///
    /// `available` lists the agents control may pass to: team members able
    /// to generate, excluding the active agent.
    pub fn detect(&self, response_text: &str, directives: &[Directive], available: &[&str]) -> RoutingDecision {
        let mut warnings = Vec::new();

        for directive in directives {
            match directive {
                Directive::Complete => {
                    return RoutingDecision {
                        warnings,
                        ..RoutingDecision::new(RouteAction::Complete, RouteMethod::Directive)
                    };
                }
                Directive::Transfer(dest) if available.contains(&dest.as_str()) => {
                    return RoutingDecision {
                        warnings,
                        ..RoutingDecision::new(RouteAction::Handoff(dest.clone()), RouteMethod::Directive)
                    };
                }
                Directive::Transfer(dest) => {
                    warnings.push(format!("ignoring transfer to unavailable agent '{dest}'"));
                }
                Directive::Malformed(reason) => warnings.push(reason.clone()),
            }
        }

        let mut matched = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| available.contains(&rule.destination()) && rule.matches(response_text));

        if let Some((index, winner)) = matched.next() {
            let mut also_matched: Vec<String> = Vec::new();
            for (_, rule) in matched {
                let dest = rule.destination();
                if dest != winner.destination() && !also_matched.iter().any(|d| d == dest) {
                    also_matched.push(dest.to_string());
                }
            }
            return RoutingDecision {
                action: RouteAction::Handoff(winner.destination().to_string()),
                method: RouteMethod::Rule(index),
                also_matched,
                warnings,
            };
        }

        let decision = if self.completion.iter().any(|p| p.is_match(response_text)) {
            RoutingDecision::new(RouteAction::Complete, RouteMethod::CompletionPattern)
        } else {
            RoutingDecision::new(RouteAction::Continue, RouteMethod::None)
        };
        RoutingDecision { warnings, ..decision }
    }
}

impl Default for HandoffRouter {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
