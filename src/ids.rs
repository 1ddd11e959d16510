//! Newtyped identities so a `FeatureId` can never be passed where a
//! `ProjectId` is expected.

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(ProjectId);
id_type!(FeatureId);
id_type!(AgentRunId);
id_type!(ThreadId);
id_type!(JobId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types_with_the_same_repr() {
        let project = ProjectId(1);
        let feature = FeatureId(1);
        assert_eq!(project.0, feature.0);
        assert_eq!(format!("{}", project), "1");
    }

    #[test]
    fn ids_order_by_inner_value() {
        assert!(FeatureId(1) < FeatureId(2));
    }
}
