//! Migration recording
//!
//! Scripts never run against the database directly. They talk to a
//! recorder whose model facades accept the same operations as a live
//! model handle but only append tasks; the runner compiles and executes
//! the list later.

use serde_json::{Map, Value};

use crate::property::Property;

/// One recorded task.
#[derive(Debug)]
pub enum MigrationOp {
    Define {
        model: String,
        properties: Vec<Property>,
    },
    Setup {
        model: String,
    },
    AddProperty {
        model: String,
        property: Property,
    },
    RemoveProperty {
        model: String,
        property: String,
    },
    ChangeProperty {
        model: String,
        property: Property,
    },
    Create {
        model: String,
        set_map: Map<String, Value>,
    },
    Update {
        model: String,
        where_map: Map<String, Value>,
        set_map: Map<String, Value>,
    },
    Remove {
        model: String,
        where_map: Map<String, Value>,
    },
    RemoveAll {
        model: String,
    },
    Execute {
        sql: String,
        params: Vec<Value>,
    },
    ForceDestroy {
        model: String,
    },
}

/// Accumulates the task list for one direction of one script.
#[derive(Default)]
pub struct MigrationRecorder {
    ops: Vec<MigrationOp>,
}

impl MigrationRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a model definition and hand back its facade.
    pub fn define(&mut self, model: &str, properties: Vec<Property>) -> RecordingModel<'_> {
        self.ops.push(MigrationOp::Define {
            model: model.to_string(),
            properties,
        });
        self.model(model)
    }

    /// Facade over an already-defined model.
    pub fn model(&mut self, model: &str) -> RecordingModel<'_> {
        RecordingModel {
            recorder: self,
            model: model.to_string(),
        }
    }

    /// Record a raw statement.
    pub fn execute(&mut self, sql: impl Into<String>, params: Vec<Value>) {
        self.ops.push(MigrationOp::Execute {
            sql: sql.into(),
            params,
        });
    }

    pub fn ops(&self) -> &[MigrationOp] {
        &self.ops
    }

    pub(crate) fn into_ops(self) -> Vec<MigrationOp> {
        self.ops
    }
}

/// Model facade that records instead of executing.
pub struct RecordingModel<'a> {
    recorder: &'a mut MigrationRecorder,
    model: String,
}

impl RecordingModel<'_> {
    fn push(&mut self, op: MigrationOp) -> &mut Self {
        self.recorder.ops.push(op);
        self
    }

    /// Create the physical relation for the model as currently declared.
    pub fn setup(&mut self) -> &mut Self {
        let model = self.model.clone();
        self.push(MigrationOp::Setup { model })
    }

    pub fn add_property(&mut self, property: Property) -> &mut Self {
        let model = self.model.clone();
        self.push(MigrationOp::AddProperty { model, property })
    }

    pub fn remove_property(&mut self, property: &str) -> &mut Self {
        let model = self.model.clone();
        self.push(MigrationOp::RemoveProperty {
            model,
            property: property.to_string(),
        })
    }

    /// Redefine an existing property's kind and modifiers; the column
    /// type changes with it.
    pub fn change_property(&mut self, property: Property) -> &mut Self {
        let model = self.model.clone();
        self.push(MigrationOp::ChangeProperty { model, property })
    }

    pub fn create(&mut self, set_map: Map<String, Value>) -> &mut Self {
        let model = self.model.clone();
        self.push(MigrationOp::Create { model, set_map })
    }

    pub fn update(
        &mut self,
        where_map: Map<String, Value>,
        set_map: Map<String, Value>,
    ) -> &mut Self {
        let model = self.model.clone();
        self.push(MigrationOp::Update {
            model,
            where_map,
            set_map,
        })
    }

    pub fn remove(&mut self, where_map: Map<String, Value>) -> &mut Self {
        let model = self.model.clone();
        self.push(MigrationOp::Remove { model, where_map })
    }

    pub fn remove_all(&mut self) -> &mut Self {
        let model = self.model.clone();
        self.push(MigrationOp::RemoveAll { model })
    }

    /// Drop the relation and forget the model, cascading through
    /// dependents.
    pub fn force_destroy(&mut self) -> &mut Self {
        let model = self.model.clone();
        self.push(MigrationOp::ForceDestroy { model })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{Modifier, PropertyKind};

    #[test]
    fn records_in_call_order() {
        let mut recorder = MigrationRecorder::new();
        let mut user = recorder.define(
            "user",
            vec![Property::new("name", PropertyKind::Text, vec![Modifier::Required]).unwrap()],
        );
        user.setup();
        let mut set_map = Map::new();
        set_map.insert("name".to_string(), Value::String("seed".to_string()));
        recorder.model("user").create(set_map);

        let ops = recorder.ops();
        assert_eq!(ops.len(), 3);
        assert!(matches!(ops[0], MigrationOp::Define { .. }));
        assert!(matches!(ops[1], MigrationOp::Setup { .. }));
        assert!(matches!(ops[2], MigrationOp::Create { .. }));
    }

    #[test]
    fn facade_chains_tasks() {
        let mut recorder = MigrationRecorder::new();
        recorder
            .model("post")
            .add_property(Property::new("title", PropertyKind::Text, vec![]).unwrap())
            .change_property(Property::new("views", PropertyKind::Integer, vec![]).unwrap())
            .remove_property("draft");
        recorder.execute("VACUUM", vec![]);

        let ops = recorder.ops();
        assert_eq!(ops.len(), 4);
        assert!(matches!(ops[1], MigrationOp::ChangeProperty { .. }));
        assert!(matches!(ops[2], MigrationOp::RemoveProperty { .. }));
        assert!(matches!(ops[3], MigrationOp::Execute { .. }));
    }
}
