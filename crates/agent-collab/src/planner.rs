use std::sync::Arc;

use agent_runtime::{
    complete_with_retry, AgentProfile, CompletionRequest, CompletionService, Message,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::PlannerSettings;
use crate::error::PlanningError;
use crate::plan::{default_step_key, Plan, PlanOrigin, Step};

const PLANNER_SYSTEM_PROMPT: &str =
    "You are a task planner coordinating multiple AI agents. You answer with JSON only.";

const DEFAULT_PREAMBLE: &str = "You are a task planner coordinating multiple AI agents. \
Break the task below into an ordered list of steps and assign every step to exactly one agent.";

/// Shortest name fragment allowed to match by prefix or substring.
const MIN_FUZZY_LEN: usize = 3;

/// Maps a task onto agent steps with one completion call.
///
/// Model output is never trusted: anything that does not parse into a plan
/// naming only roster agents is replaced by the round-robin fallback.
pub struct Planner {
    service: Arc<dyn CompletionService>,
    settings: PlannerSettings,
}

impl Planner {
    pub fn new(service: Arc<dyn CompletionService>) -> Self {
        Self {
            service,
            settings: PlannerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: PlannerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_planning_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.settings.planning_prompt = Some(prompt.into());
        self
    }

    pub fn settings(&self) -> &PlannerSettings {
        &self.settings
    }

    pub fn build_prompt(&self, task: &str, roster: &[AgentProfile]) -> String {
        let names: Vec<&str> = roster.iter().map(|p| p.name.as_str()).collect();
        let example_agent = names.first().copied().unwrap_or("AgentName");

        let mut prompt = String::new();
        prompt.push_str(
            self.settings
                .planning_prompt
                .as_deref()
                .map(str::trim)
                .unwrap_or(DEFAULT_PREAMBLE),
        );
        prompt.push_str("\n\nTask: ");
        prompt.push_str(task);
        prompt.push_str("\n\nAvailable agents:\n");
        for profile in roster {
            prompt.push_str(&format!("- {}\n", profile.name));
            prompt.push_str(&format!("  Role: {}\n", profile.system_prompt.trim()));
            if !profile.tools.is_empty() {
                prompt.push_str("  Tools:\n");
                for tool in &profile.tools {
                    prompt.push_str(&format!("    - {}: {}\n", tool.name, tool.description));
                }
            }
        }
        prompt.push_str(&format!(
            "\nYou must ONLY use these exact agent names: {}\n",
            names.join(", ")
        ));
        prompt.push_str(&format!(
            "\nRespond with a JSON array and nothing else:\n[\n  {{\"step\": \"step-1\", \"agent\": \"{example_agent}\", \"instruction\": \"What the agent should do\", \"depends_on\": []}}\n]\n"
        ));
        prompt.push_str(
            "\nRules:\n\
             - Do not invent agent names or use role names that are not listed.\n\
             - \"depends_on\" lists the \"step\" values of earlier steps whose output is needed.\n\
             - Order the steps logically and consider each agent's tools.\n",
        );
        prompt
    }

    /// Produce a validated plan for `task`. Only an empty roster is an error.
    pub async fn plan(&self, task: &str, roster: &[AgentProfile]) -> Result<Plan, PlanningError> {
        if roster.is_empty() {
            return Err(PlanningError::EmptyRoster);
        }
        let names: Vec<String> = roster.iter().map(|p| p.name.clone()).collect();

        let request = CompletionRequest {
            system_prompt: PLANNER_SYSTEM_PROMPT.to_string(),
            messages: vec![Message::user(self.build_prompt(task, roster))],
            tools: Vec::new(),
            options: self.settings.model.clone(),
        };
        let response = match complete_with_retry(
            self.service.as_ref(),
            &request,
            &self.settings.retry,
            self.settings.request_timeout(),
        )
        .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    target: "agent_collab::planner",
                    error = %err,
                    "planning call failed, using fallback plan"
                );
                return Ok(fallback_plan(task, &names));
            }
        };

        let text = response.content.unwrap_or_default();
        if text.trim().is_empty() {
            warn!(
                target: "agent_collab::planner",
                "planning response was empty, using fallback plan"
            );
            return Ok(fallback_plan(task, &names));
        }

        match parse_plan(&text, &names) {
            Ok(plan) => {
                info!(
                    target: "agent_collab::planner",
                    steps = plan.len(),
                    origin = %plan.origin,
                    "plan created"
                );
                Ok(plan)
            }
            Err(reason) => {
                warn!(
                    target: "agent_collab::planner",
                    reason = %reason,
                    response_len = text.len(),
                    "planning response unusable, using fallback plan"
                );
                debug!(target: "agent_collab::planner", response = %text, "rejected plan");
                Ok(fallback_plan(task, &names))
            }
        }
    }
}

/// Validate a caller-supplied plan against the roster. Agent names are
/// resolved the same way as for model plans, but failures are reported.
pub fn validate_supplied(mut plan: Plan, roster: &[AgentProfile]) -> Result<Plan, PlanningError> {
    if roster.is_empty() {
        return Err(PlanningError::EmptyRoster);
    }
    let names: Vec<String> = roster.iter().map(|p| p.name.clone()).collect();
    for step in &mut plan.steps {
        match resolve_agent_name(&step.agent, &names) {
            Some(name) => step.agent = name.to_string(),
            None => {
                return Err(PlanningError::InvalidPlan(format!(
                    "step `{}` names unknown agent `{}`",
                    step.key, step.agent
                )))
            }
        }
    }
    plan.check_structure().map_err(PlanningError::InvalidPlan)?;
    Ok(plan)
}

/// One step per agent, in roster order, each given the whole task.
pub fn fallback_plan(task: &str, roster: &[String]) -> Plan {
    let steps = roster
        .iter()
        .enumerate()
        .map(|(idx, name)| Step::new(default_step_key(idx), name.clone(), task))
        .collect();
    Plan::new(steps, PlanOrigin::Fallback)
}

/// Map a model-supplied agent name onto the roster.
///
/// Tried in order, each stage accepting only a unique match: exact,
/// ASCII case-insensitive, normalized equality (lowercase alphanumerics),
/// normalized prefix in either direction, normalized substring in either
/// direction. Fragments shorter than three characters never match fuzzily.
pub fn resolve_agent_name<'a>(candidate: &str, roster: &'a [String]) -> Option<&'a str> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return None;
    }
    if let Some(name) = roster.iter().find(|name| name.as_str() == candidate) {
        return Some(name);
    }
    if let Some(name) = unique(roster, |name| name.eq_ignore_ascii_case(candidate)) {
        return Some(name);
    }

    let wanted = normalize(candidate);
    if wanted.is_empty() {
        return None;
    }
    if let Some(name) = unique(roster, |name| normalize(name) == wanted) {
        return Some(name);
    }
    let fuzzy = |name: &str, test: fn(&str, &str) -> bool| {
        let have = normalize(name);
        let shorter = have.len().min(wanted.len());
        shorter >= MIN_FUZZY_LEN && (test(&have, &wanted) || test(&wanted, &have))
    };
    if let Some(name) = unique(roster, |name| fuzzy(name, |a, b| a.starts_with(b))) {
        return Some(name);
    }
    unique(roster, |name| fuzzy(name, |a, b| a.contains(b)))
}

fn unique<'a>(roster: &'a [String], mut pred: impl FnMut(&str) -> bool) -> Option<&'a str> {
    let mut found = None;
    for name in roster {
        if pred(name.as_str()) {
            if found.is_some() {
                return None;
            }
            found = Some(name.as_str());
        }
    }
    found
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn parse_plan(text: &str, roster: &[String]) -> Result<Plan, String> {
    let mut first_error = None;
    let raw_steps = json_values(text)
        .find_map(|document| match step_values(document) {
            Ok(items) if !items.is_empty() && items.iter().all(Value::is_object) => Some(items),
            Ok(_) => None,
            Err(reason) => {
                first_error.get_or_insert(reason);
                None
            }
        })
        .ok_or_else(|| {
            first_error.unwrap_or_else(|| "no step list found in response".to_string())
        })?;

    let mut steps = Vec::with_capacity(raw_steps.len());
    for (idx, raw) in raw_steps.into_iter().enumerate() {
        let mut step = parse_step(idx, raw)?;
        let resolved = resolve_agent_name(&step.agent, roster)
            .ok_or_else(|| format!("step `{}` names unknown agent `{}`", step.key, step.agent))?;
        if resolved != step.agent {
            debug!(
                target: "agent_collab::planner",
                from = %step.agent,
                to = %resolved,
                "corrected agent name"
            );
            step.agent = resolved.to_string();
        }
        steps.push(step);
    }

    let plan = Plan::new(steps, PlanOrigin::Model);
    plan.check_structure()?;
    Ok(plan)
}

/// Accept a bare array, an object wrapping the array, or one step object.
fn step_values(document: Value) -> Result<Vec<Value>, String> {
    match document {
        Value::Array(items) => Ok(items),
        Value::Object(map) if map.contains_key("agent") => Ok(vec![Value::Object(map)]),
        Value::Object(map) => map
            .into_iter()
            .map(|(_, value)| value)
            .find(|value| {
                value
                    .as_array()
                    .and_then(|items| items.first())
                    .and_then(Value::as_object)
                    .is_some_and(|first| first.contains_key("agent"))
            })
            .and_then(|value| match value {
                Value::Array(items) => Some(items),
                _ => None,
            })
            .ok_or_else(|| "JSON object holds no step list".to_string()),
        other => Err(format!("expected a step list, got {other}")),
    }
}

fn parse_step(idx: usize, raw: Value) -> Result<Step, String> {
    let position = idx + 1;
    let Value::Object(fields) = raw else {
        return Err(format!("step {position} is not an object"));
    };

    let key = ["step", "key", "id"]
        .iter()
        .find_map(|name| fields.get(*name).and_then(step_key))
        .unwrap_or_else(|| default_step_key(idx));

    let agent = fields
        .get("agent")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| format!("step {position} names no agent"))?
        .to_string();

    let instruction =
        instruction_text(&fields).ok_or_else(|| format!("step {position} has no instruction"))?;

    let depends_on = ["depends_on", "dependencies", "after"]
        .iter()
        .find_map(|name| fields.get(*name))
        .map(dependency_keys)
        .transpose()
        .map_err(|reason| format!("step {position}: {reason}"))?
        .unwrap_or_default();

    Ok(Step {
        key,
        agent,
        instruction,
        depends_on,
    })
}

fn non_empty_str<'a>(fields: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

fn instruction_text(fields: &Map<String, Value>) -> Option<String> {
    if let Some(text) = non_empty_str(fields, "instruction") {
        return Some(text.to_string());
    }
    match (
        non_empty_str(fields, "action"),
        non_empty_str(fields, "instructions"),
    ) {
        (Some(action), Some(details)) if action != details => {
            return Some(format!("{action}\n\nInstructions: {details}"))
        }
        (Some(text), _) | (None, Some(text)) => return Some(text.to_string()),
        (None, None) => {}
    }
    non_empty_str(fields, "task").map(str::to_string)
}

/// Numeric keys (`1`, `"2"`) become `step-N` so dependencies line up.
fn step_key(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| format!("step-{n}")),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                None
            } else if s.chars().all(|c| c.is_ascii_digit()) {
                Some(format!("step-{s}"))
            } else {
                Some(s.to_string())
            }
        }
        _ => None,
    }
}

fn dependency_keys(value: &Value) -> Result<Vec<String>, String> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .iter()
            .map(|item| step_key(item).ok_or_else(|| format!("bad dependency {item}")))
            .collect(),
        single => step_key(single)
            .map(|key| vec![key])
            .ok_or_else(|| format!("bad dependency {single}")),
    }
}

/// Find the first balanced JSON array or object in free-form model output.
///
/// Handles code fences and surrounding prose. Raw control characters inside
/// strings are escaped before a second parse attempt.
pub fn extract_json(text: &str) -> Option<Value> {
    json_values(text).next()
}

/// Every balanced JSON array or object in `text`, in order. A span that
/// parses is skipped as a whole; one that does not is rescanned from its
/// next character.
pub fn json_values(text: &str) -> impl Iterator<Item = Value> + '_ {
    let mut offset = 0;
    std::iter::from_fn(move || {
        while let Some((rel, ch)) = text[offset..].char_indices().next() {
            let start = offset + rel;
            offset = start + ch.len_utf8();
            if ch != '[' && ch != '{' {
                continue;
            }
            let Some(end) = balanced_end(&text[start..]) else {
                continue;
            };
            let candidate = &text[start..start + end];
            let parsed = serde_json::from_str::<Value>(candidate)
                .or_else(|_| serde_json::from_str::<Value>(&escape_control_chars(candidate)));
            if let Ok(value) = parsed {
                offset = start + end;
                return Some(value);
            }
        }
        None
    })
}

/// Byte length of the bracketed region starting at the first char of `text`.
fn balanced_end(text: &str) -> Option<usize> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => stack.push(']'),
            '{' => stack.push('}'),
            ']' | '}' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(idx + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

fn escape_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
        } else {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
        }
    }
    out
}
