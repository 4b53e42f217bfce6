//! Shared test helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use devirt::code::{SiteLabel, Word};
use devirt::hierarchy::{ClassDescriptor, ClassFlags, ClassHierarchy, NoClassSource};
use devirt::ids::{BodyId, ClassId, MethodId};
use devirt::{JitOptions, JitRuntime};

// The zoo:
//
//   Object(1)
//   ├── Animal(2, abstract, speak 20 abstract)
//   │   ├── Dog(3, speak 30)
//   │   │   └── Puppy(4)
//   │   └── Cat(6, final, speak 60, name 61) ── implements Pet
//   ├── Pet(5, interface, name 50 abstract)
//   ├── Rock(7, roll 70)
//   ├── int(8, primitive)
//   └── Dog[](9), int[](10)
pub const OBJECT: ClassId = ClassId(1);
pub const ANIMAL: ClassId = ClassId(2);
pub const DOG: ClassId = ClassId(3);
pub const PUPPY: ClassId = ClassId(4);
pub const PET: ClassId = ClassId(5);
pub const CAT: ClassId = ClassId(6);
pub const ROCK: ClassId = ClassId(7);
pub const INT: ClassId = ClassId(8);
pub const DOG_ARRAY: ClassId = ClassId(9);
pub const INT_ARRAY: ClassId = ClassId(10);

pub const ANIMAL_SPEAK: MethodId = MethodId(20);
pub const DOG_SPEAK: MethodId = MethodId(30);
pub const PET_NAME: MethodId = MethodId(50);
pub const CAT_SPEAK: MethodId = MethodId(60);
pub const CAT_NAME: MethodId = MethodId(61);
pub const ROCK_ROLL: MethodId = MethodId(70);

pub const SPEAK: &str = "speak()V";
pub const NAME: &str = "name()Ljava/lang/String;";
pub const ROLL: &str = "roll()V";

/// The zoo's classes in load order
pub fn zoo() -> Vec<ClassDescriptor> {
    vec![
        ClassDescriptor::new(OBJECT, "Object"),
        ClassDescriptor::new(ANIMAL, "Animal")
            .with_flags(ClassFlags::ABSTRACT)
            .abstract_method(ANIMAL_SPEAK, SPEAK),
        ClassDescriptor::new(DOG, "Dog").extends(ANIMAL).method(DOG_SPEAK, SPEAK),
        ClassDescriptor::new(PUPPY, "Puppy").extends(DOG),
        ClassDescriptor::new(PET, "Pet")
            .with_flags(ClassFlags::INTERFACE | ClassFlags::ABSTRACT)
            .abstract_method(PET_NAME, NAME),
        ClassDescriptor::new(CAT, "Cat")
            .extends(ANIMAL)
            .implements(PET)
            .with_flags(ClassFlags::FINAL)
            .method(CAT_SPEAK, SPEAK)
            .method(CAT_NAME, NAME),
        ClassDescriptor::new(ROCK, "Rock").method(ROCK_ROLL, ROLL),
        ClassDescriptor::new(INT, "int").with_flags(ClassFlags::PRIMITIVE | ClassFlags::FINAL),
        ClassDescriptor::new(DOG_ARRAY, "Dog[]").array_of(DOG),
        ClassDescriptor::new(INT_ARRAY, "int[]").array_of(INT),
    ]
}

/// A bare registry holding `classes`
pub fn hierarchy_of(options: &JitOptions, classes: Vec<ClassDescriptor>) -> ClassHierarchy {
    let mut hierarchy = ClassHierarchy::new(options);
    for class in classes {
        hierarchy.class_loaded(class, &NoClassSource).unwrap();
    }
    hierarchy
}

pub fn zoo_hierarchy() -> ClassHierarchy {
    hierarchy_of(&JitOptions::default(), zoo())
}

pub fn zoo_runtime_with(options: JitOptions) -> Arc<JitRuntime> {
    let runtime = JitRuntime::new(options);
    for class in zoo() {
        runtime.load_class(class, &NoClassSource).unwrap();
    }
    runtime
}

pub fn zoo_runtime() -> Arc<JitRuntime> {
    zoo_runtime_with(JitOptions::default())
}

/// Current contents of a site in a committed body
pub fn site_word(runtime: &JitRuntime, body: BodyId, label: SiteLabel) -> Option<Word> {
    runtime.lock().code.body(body).and_then(|b| b.read_label(label))
}

/// The branch a site holds once patched towards `destination`
pub fn jump_to(runtime: &JitRuntime, body: BodyId, destination: SiteLabel) -> Option<Word> {
    runtime
        .lock()
        .code
        .body(body)
        .map(|b| Word::Jump(b.address_of(destination)))
}
