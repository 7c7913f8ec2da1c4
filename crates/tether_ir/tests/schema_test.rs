use tether_ir::{
    DeleteBehavior, EntitySchema, FieldSchema, NullNavigationPolicy, RelationshipSchema, Schema, SchemaError,
};

fn child() -> EntitySchema {
    EntitySchema::new("Child")
}

fn parent() -> EntitySchema {
    EntitySchema::new("Parent")
        .field(FieldSchema::integer("child_id").required())
        .belongs_to(RelationshipSchema::belongs_to("child", "Child", "child_id"))
}

#[test]
fn parent_child_model_is_valid() {
    let schema = Schema::new().with_entity(parent()).with_entity(child());
    schema.validate().unwrap();

    let order: Vec<&str> = schema
        .dependency_order()
        .unwrap()
        .iter()
        .map(|e| e.name.as_str())
        .collect();
    assert_eq!(order, vec!["Child", "Parent"]);
}

#[test]
fn defaults_follow_entity_name() {
    let entity = EntitySchema::new("OrderLine");
    assert_eq!(entity.table_name.as_str(), "order_line");
    assert_eq!(entity.key_field(), "id");
    assert!(entity.get_field("id").unwrap().required);

    let rel = RelationshipSchema::belongs_to("child", "Child", "child_id");
    assert_eq!(rel.on_delete, DeleteBehavior::Restrict);
    assert_eq!(rel.on_null_navigation, NullNavigationPolicy::KeepForeignKey);
}

#[test]
fn duplicate_entities_and_tables_are_rejected() {
    let err = Schema::new().with_entity(child()).with_entity(child()).validate().unwrap_err();
    assert_eq!(err, SchemaError::DuplicateEntity("Child".into()));

    let err = Schema::new()
        .with_entity(child())
        .with_entity(EntitySchema::new("Other").table("child"))
        .validate()
        .unwrap_err();
    assert_eq!(err, SchemaError::DuplicateTable("child".into()));
}

#[test]
fn relationship_needs_target_and_foreign_key() {
    let err = Schema::new().with_entity(parent()).validate().unwrap_err();
    assert!(matches!(err, SchemaError::UnknownTarget { .. }));

    let orphan = EntitySchema::new("Parent").belongs_to(RelationshipSchema::belongs_to("child", "Child", "child_id"));
    let err = Schema::new().with_entity(child()).with_entity(orphan).validate().unwrap_err();
    assert_eq!(
        err,
        SchemaError::MissingForeignKey {
            entity: "Parent".into(),
            relationship: "child".into(),
            field: "child_id".into(),
        }
    );
}

#[test]
fn foreign_key_must_be_an_integer() {
    let entity = EntitySchema::new("Parent")
        .field(FieldSchema::text("child_id"))
        .belongs_to(RelationshipSchema::belongs_to("child", "Child", "child_id"));
    let err = Schema::new().with_entity(child()).with_entity(entity).validate().unwrap_err();
    assert!(matches!(err, SchemaError::NonIntegerKey { .. }));
}

#[test]
fn set_null_requires_optional_foreign_key() {
    let entity = EntitySchema::new("Parent")
        .field(FieldSchema::integer("child_id").required())
        .belongs_to(RelationshipSchema::belongs_to("child", "Child", "child_id").on_delete(DeleteBehavior::SetNull));
    let err = Schema::new().with_entity(child()).with_entity(entity).validate().unwrap_err();
    assert!(matches!(err, SchemaError::SetNullOnRequired { .. }));
}

#[test]
fn navigation_cannot_shadow_a_field() {
    let entity = EntitySchema::new("Parent")
        .field(FieldSchema::integer("child").required())
        .belongs_to(RelationshipSchema::belongs_to("child", "Child", "child"));
    let err = Schema::new().with_entity(child()).with_entity(entity).validate().unwrap_err();
    assert_eq!(
        err,
        SchemaError::NavigationCollision {
            entity: "Parent".into(),
            name: "child".into(),
        }
    );
}

#[test]
fn renamed_key_must_exist_as_integer() {
    let mut entity = EntitySchema::new("Child").key("child_key");
    assert_eq!(entity.key_field(), "child_key");
    assert!(entity.get_field("id").is_none());
    Schema::new().with_entity(entity.clone()).validate().unwrap();

    entity.fields[0] = FieldSchema::text("child_key");
    let err = Schema::new().with_entity(entity).validate().unwrap_err();
    assert!(matches!(err, SchemaError::NonIntegerKey { .. }));
}

#[test]
fn hostile_identifiers_are_rejected() {
    let err = Schema::new()
        .with_entity(EntitySchema::new("Child").table("child\"; DROP TABLE x; --"))
        .validate()
        .unwrap_err();
    assert!(matches!(err, SchemaError::InvalidIdentifier(_)));
}

#[test]
fn cycles_are_reported() {
    let a = EntitySchema::new("A")
        .field(FieldSchema::integer("b_id"))
        .belongs_to(RelationshipSchema::belongs_to("b", "B", "b_id"));
    let b = EntitySchema::new("B")
        .field(FieldSchema::integer("a_id"))
        .belongs_to(RelationshipSchema::belongs_to("a", "A", "a_id"));
    let err = Schema::new().with_entity(a).with_entity(b).validate().unwrap_err();
    assert!(matches!(err, SchemaError::DependencyCycle(names) if names.len() == 2));
}

#[test]
fn self_reference_is_not_a_cycle() {
    let node = EntitySchema::new("Node")
        .field(FieldSchema::integer("parent_id"))
        .belongs_to(RelationshipSchema::belongs_to("parent", "Node", "parent_id"));
    Schema::new().with_entity(node).validate().unwrap();
}

#[test]
fn schema_roundtrips_through_json() {
    let schema = Schema::new().with_entity(child()).with_entity(parent());
    let json = serde_json::to_value(&schema).unwrap();
    assert_eq!(json["entities"][1]["relationships"][0]["on_null_navigation"], "keep_foreign_key");

    let back: Schema = serde_json::from_value(json).unwrap();
    back.validate().unwrap();
    assert_eq!(back.entity("Parent").unwrap().relationship("child").unwrap().on_delete, DeleteBehavior::Restrict);
}
