use std::collections::HashSet;
use std::sync::Arc;

use ensemble_core::agent::{Agent, AgentDescriptor};

use crate::error::EngineError;

/// A descriptor paired with the generate capability that speaks for it.
#[derive(Clone)]
pub struct TeamMember {
    pub descriptor: AgentDescriptor,
    pub agent: Arc<dyn Agent>,
}

impl TeamMember {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Agents collaborating on a task, in declaration order.
pub struct Team {
    members: Vec<TeamMember>,
    initial: String,
}

impl Team {
    pub fn builder() -> TeamBuilder {
        TeamBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&TeamMember> {
        self.members.iter().find(|m| m.name() == name)
    }

    pub fn initial(&self) -> &str {
        &self.initial
    }

    pub fn members(&self) -> &[TeamMember] {
        &self.members
    }

    pub fn names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name()).collect()
    }

    /// Agents control may pass to from `active`.
    pub fn available_destinations(&self, active: &str) -> Vec<&str> {
        self.members
            .iter()
            .filter(|m| m.name() != active && m.descriptor.capabilities.can_generate)
            .map(|m| m.name())
            .collect()
    }
}

#[derive(Default)]
pub struct TeamBuilder {
    members: Vec<TeamMember>,
    initial: Option<String>,
}

impl TeamBuilder {
    pub fn member(mut self, descriptor: AgentDescriptor, agent: Arc<dyn Agent>) -> Self {
        self.members.push(TeamMember { descriptor, agent });
        self
    }

    /// Designate the agent that takes the first round. Defaults to the first member.
    pub fn initial(mut self, name: impl Into<String>) -> Self {
        self.initial = Some(name.into());
        self
    }

    pub fn build(mut self) -> Result<Team, EngineError> {
        if self.members.is_empty() {
            return Err(EngineError::Team("team has no members".into()));
        }

        let mut seen = HashSet::new();
        for (order, member) in self.members.iter_mut().enumerate() {
            if !seen.insert(member.descriptor.name.clone()) {
                return Err(EngineError::Team(format!(
                    "duplicate agent name '{}'",
                    member.descriptor.name
                )));
            }
            member.descriptor.order = order;
        }

        let initial = match self.initial {
            Some(name) => name,
            None => self.members[0].descriptor.name.clone(),
        };
        let Some(first) = self.members.iter().find(|m| m.name() == initial) else {
            return Err(EngineError::Team(format!("initial agent '{initial}' is not a member")));
        };
        if !first.descriptor.capabilities.can_generate {
            return Err(EngineError::Team(format!("initial agent '{initial}' cannot generate")));
        }

        Ok(Team {
            members: self.members,
            initial,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedAgent, ScriptedTurn};
    use ensemble_core::agent::AgentCapabilities;

    fn agent() -> Arc<dyn Agent> {
        Arc::new(ScriptedAgent::repeating(ScriptedTurn::text("ok")))
    }

    fn silent() -> AgentCapabilities {
        AgentCapabilities {
            can_generate: false,
            can_call_tools: false,
        }
    }

    #[test]
    fn builds_in_declaration_order() {
        let team = Team::builder()
            .member(AgentDescriptor::new("researcher", "finds sources"), agent())
            .member(AgentDescriptor::new("writer", "drafts"), agent())
            .member(AgentDescriptor::new("archivist", "stores").with_capabilities(silent()), agent())
            .build()
            .unwrap();

        assert_eq!(team.initial(), "researcher");
        assert_eq!(team.names(), vec!["researcher", "writer", "archivist"]);
        assert_eq!(team.get("writer").unwrap().descriptor.order, 1);
        assert_eq!(team.available_destinations("researcher"), vec!["writer"]);
        assert_eq!(team.available_destinations("writer"), vec!["researcher"]);
    }

    #[test]
    fn rejects_invalid_teams() {
        assert!(matches!(Team::builder().build(), Err(EngineError::Team(_))));

        let dup = Team::builder()
            .member(AgentDescriptor::new("writer", "a"), agent())
            .member(AgentDescriptor::new("writer", "b"), agent())
            .build();
        assert!(matches!(dup, Err(EngineError::Team(msg)) if msg.contains("duplicate")));

        let missing = Team::builder()
            .member(AgentDescriptor::new("writer", "a"), agent())
            .initial("editor")
            .build();
        assert!(matches!(missing, Err(EngineError::Team(msg)) if msg.contains("not a member")));

        let mute = Team::builder()
            .member(AgentDescriptor::new("writer", "a").with_capabilities(silent()), agent())
            .build();
        assert!(matches!(mute, Err(EngineError::Team(msg)) if msg.contains("cannot generate")));
    }

    #[test]
    fn explicit_initial_agent() {
        let team = Team::builder()
            .member(AgentDescriptor::new("researcher", "a"), agent())
            .member(AgentDescriptor::new("writer", "b"), agent())
            .initial("writer")
            .build()
            .unwrap();
        assert_eq!(team.initial(), "writer");
    }
}
