//! Presence avatar strip.
//!
//! One model builder for every place participants are listed; the
//! differences between placements are [`WidgetFeatures`] switches.

use log::trace;

use crate::follow::FollowController;
use crate::presence::participant_color;
use crate::protocol::{ParticipantPresence, PresenceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WidgetFeatures {
    /// Avatars shown before collapsing the rest into an overflow count.
    pub max_avatars: usize,
    pub show_status: bool,
    pub include_self: bool,
    pub show_follow_controls: bool,
}

impl Default for WidgetFeatures {
    fn default() -> Self {
        Self {
            max_avatars: 5,
            show_status: true,
            include_self: true,
            show_follow_controls: true,
        }
    }
}

impl WidgetFeatures {
    /// Header badge: a few faces, nothing interactive.
    pub fn compact() -> Self {
        Self {
            max_avatars: 3,
            show_status: false,
            include_self: false,
            show_follow_controls: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarView {
    pub participant_id: String,
    pub name: String,
    pub initials: String,
    pub color: String,
    pub avatar: Option<String>,
    pub status: Option<PresenceStatus>,
    pub is_self: bool,
    pub is_followed: bool,
    pub can_follow: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WidgetModel {
    pub avatars: Vec<AvatarView>,
    /// Participants hidden behind "+N".
    pub overflow: usize,
    pub follow_target: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PresenceWidget {
    features: WidgetFeatures,
    local_participant: String,
}

impl PresenceWidget {
    pub fn new(local_participant: &str, features: WidgetFeatures) -> Self {
        Self {
            features,
            local_participant: local_participant.to_string(),
        }
    }

    pub fn features(&self) -> WidgetFeatures {
        self.features
    }

    /// Self first, then everyone else in snapshot order.
    pub fn model(&self, snapshot: &[ParticipantPresence], follow: Option<&FollowController>) -> WidgetModel {
        let follow_target = follow
            .and_then(FollowController::followed_id)
            .map(str::to_string);
        let (mine, others): (Vec<&ParticipantPresence>, Vec<&ParticipantPresence>) = snapshot
            .iter()
            .partition(|p| p.participant_id == self.local_participant);

        let visible: Vec<&ParticipantPresence> = mine
            .into_iter()
            .take(usize::from(self.features.include_self))
            .chain(others)
            .collect();
        let shown = visible.len().min(self.features.max_avatars);
        let avatars = visible[..shown]
            .iter()
            .map(|p| self.avatar(p, follow_target.as_deref()))
            .collect();

        trace!("Presence widget: {} shown, {} overflow", shown, visible.len() - shown);
        WidgetModel {
            avatars,
            overflow: visible.len() - shown,
            follow_target,
        }
    }

    fn avatar(&self, presence: &ParticipantPresence, follow_target: Option<&str>) -> AvatarView {
        let is_self = presence.participant_id == self.local_participant;
        let name = if presence.metadata.name.is_empty() {
            presence.participant_id.clone()
        } else {
            presence.metadata.name.clone()
        };
        let color = if presence.metadata.color.is_empty() {
            participant_color(&presence.participant_id).to_string()
        } else {
            presence.metadata.color.clone()
        };
        AvatarView {
            initials: initials(&name),
            participant_id: presence.participant_id.clone(),
            name,
            color,
            avatar: presence.metadata.avatar.clone(),
            status: self.features.show_status.then_some(presence.status),
            is_self,
            is_followed: follow_target == Some(presence.participant_id.as_str()),
            can_follow: self.features.show_follow_controls && !is_self,
        }
    }
}

fn initials(name: &str) -> String {
    name.split_whitespace()
        .filter_map(|word| word.chars().next())
        .take(2)
        .flat_map(char::to_uppercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::follow::FollowConfig;
    use crate::protocol::ParticipantMetadata;

    fn row(participant_id: &str, name: &str) -> ParticipantPresence {
        ParticipantPresence {
            participant_id: participant_id.into(),
            document_id: "doc".into(),
            status: PresenceStatus::Editing,
            cursor: None,
            last_heartbeat: 0,
            joined_at: 0,
            metadata: ParticipantMetadata::named(name),
        }
    }

    fn snapshot() -> Vec<ParticipantPresence> {
        vec![
            row("bob", "Bob Stone"),
            row("me", "Me"),
            row("carol", "carol ann"),
            row("dave", ""),
            row("erin", "Erin"),
        ]
    }

    #[test]
    fn test_full_widget() {
        let widget = PresenceWidget::new("me", WidgetFeatures::default());
        let mut follow = FollowController::new("me", FollowConfig::default());
        follow.toggle_follow("carol");

        let model = widget.model(&snapshot(), Some(&follow));
        let ids: Vec<&str> = model.avatars.iter().map(|a| a.participant_id.as_str()).collect();
        assert_eq!(ids, vec!["me", "bob", "carol", "dave", "erin"]);
        assert_eq!(model.overflow, 0);
        assert_eq!(model.follow_target.as_deref(), Some("carol"));

        let me = &model.avatars[0];
        assert!(me.is_self && !me.can_follow);
        assert_eq!(model.avatars[1].initials, "BS");
        assert_eq!(model.avatars[1].status, Some(PresenceStatus::Editing));
        assert!(model.avatars[2].is_followed);
        assert_eq!(model.avatars[2].initials, "CA");
        assert_eq!(model.avatars[3].name, "dave");
        assert_eq!(model.avatars[3].color, participant_color("dave"));
    }

    #[test]
    fn test_compact_widget() {
        let widget = PresenceWidget::new("me", WidgetFeatures::compact());
        let model = widget.model(&snapshot(), None);
        let ids: Vec<&str> = model.avatars.iter().map(|a| a.participant_id.as_str()).collect();
        assert_eq!(ids, vec!["bob", "carol", "dave"]);
        assert_eq!(model.overflow, 1);
        assert!(model.avatars.iter().all(|a| a.status.is_none() && !a.can_follow));
        assert_eq!(model.follow_target, None);
    }

    #[test]
    fn test_empty_snapshot() {
        let widget = PresenceWidget::new("me", WidgetFeatures::default());
        assert_eq!(widget.model(&[], None), WidgetModel::default());
    }
}
