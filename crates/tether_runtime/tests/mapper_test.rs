use serde::{Deserialize, Serialize};
use tether_runtime::entities::{Child, ChildPatch, Parent, ParentPatch};
use tether_runtime::mapper::{MapperConfiguration, MappingError};

fn loaded_parent() -> Parent {
    Parent {
        id: 1,
        child_id: 1,
        child: Some(Child { id: 1 }),
    }
}

#[test]
fn undeclared_members_keep_their_values() {
    let mapper = MapperConfiguration::new(|cfg| {
        cfg.create_map::<ParentPatch, Parent>().member("child_id");
    })
    .create_mapper();

    let mut parent = loaded_parent();
    let patch = ParentPatch {
        child_id: 2,
        child: None,
    };
    mapper.map(&patch, &mut parent).unwrap();

    assert_eq!(parent.id, 1);
    assert_eq!(parent.child_id, 2);
    // `child` is null on the patch but was not declared, so the loaded child stays.
    assert_eq!(parent.child, Some(Child { id: 1 }));
}

#[test]
fn declared_null_members_are_copied() {
    let mapper = MapperConfiguration::new(|cfg| {
        cfg.create_map::<ParentPatch, Parent>().member("child_id").member("child");
    })
    .create_mapper();

    let mut parent = loaded_parent();
    mapper
        .map(
            &ParentPatch {
                child_id: 2,
                child: None,
            },
            &mut parent,
        )
        .unwrap();
    assert_eq!(parent, Parent::new(1, 2));

    mapper
        .map(
            &ParentPatch {
                child_id: 3,
                child: Some(ChildPatch { id: 3 }),
            },
            &mut parent,
        )
        .unwrap();
    assert_eq!(parent.child, Some(Child { id: 3 }));
}

#[test]
fn skip_null_sources_leaves_destination_alone() {
    let mapper = MapperConfiguration::new(|cfg| {
        cfg.create_map::<ParentPatch, Parent>()
            .member("child_id")
            .member("child")
            .skip_null_sources();
    })
    .create_mapper();

    let mut parent = loaded_parent();
    mapper
        .map(
            &ParentPatch {
                child_id: 2,
                child: None,
            },
            &mut parent,
        )
        .unwrap();
    assert_eq!(parent.child_id, 2);
    assert_eq!(parent.child, Some(Child { id: 1 }));
}

#[derive(Serialize, Deserialize)]
struct Renamed {
    target: i64,
}

#[test]
fn member_from_reads_a_differently_named_source() {
    let mapper = MapperConfiguration::new(|cfg| {
        cfg.create_map::<Renamed, Parent>().member_from("child_id", "target");
    })
    .create_mapper();

    let mut parent = loaded_parent();
    mapper.map(&Renamed { target: 9 }, &mut parent).unwrap();
    assert_eq!(parent.child_id, 9);
    assert_eq!(parent.child, Some(Child { id: 1 }));
}

#[test]
fn misconfigured_maps_report_errors_without_touching_destination() {
    let mapper = MapperConfiguration::new(|cfg| {
        cfg.create_map::<ParentPatch, Parent>().member("name");
        cfg.create_map::<Renamed, Parent>().member("target");
    })
    .create_mapper();

    let mut parent = loaded_parent();

    let err = mapper.map(&ParentPatch::default(), &mut parent).unwrap_err();
    assert!(matches!(err, MappingError::UnknownSourceMember { ref member, .. } if member == "name"));

    let err = mapper.map(&Renamed { target: 1 }, &mut parent).unwrap_err();
    assert!(matches!(err, MappingError::UnknownDestinationMember { ref member, .. } if member == "target"));

    let err = mapper.map(&Child { id: 5 }, &mut parent).unwrap_err();
    assert!(matches!(err, MappingError::MissingMap { .. }));

    assert_eq!(parent, loaded_parent());
}
