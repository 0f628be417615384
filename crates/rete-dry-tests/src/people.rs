// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A small people/companies schema over the in-memory store.
//!
//! Every person carries `TYPE = "person"`, a `NAME` and an `AGE`; employed
//! people also reference a company through `EMPLOYER`.

use rete_core::store::{Database, TxBuilder};
use rete_core::{Attribute, Change, EntityId, Many, Query, Value};

/// Entity kind marker.
pub const TYPE: Attribute = Attribute::new("type");
/// Display name.
pub const NAME: Attribute = Attribute::new("name");
/// Age in years.
pub const AGE: Attribute = Attribute::new("age");
/// Reference from a person to a company.
pub const EMPLOYER: Attribute = Attribute::new("employer");

/// `TYPE` value of people.
pub const PERSON: &str = "person";
/// `TYPE` value of companies.
pub const COMPANY: &str = "company";

/// Stages a new person.
pub fn add_person(tx: &mut TxBuilder, name: &str, age: i64) -> EntityId {
    let person = tx.new_entity();
    tx.add(person, TYPE, PERSON)
        .add(person, NAME, name)
        .add(person, AGE, age);
    person
}

/// Stages a new company.
pub fn add_company(tx: &mut TxBuilder, name: &str) -> EntityId {
    let company = tx.new_entity();
    tx.add(company, TYPE, COMPANY).add(company, NAME, name);
    company
}

/// Commits one transaction creating every `(name, age)` person, in order.
pub fn seed_people(db: &Database, people: &[(&str, i64)]) -> Vec<EntityId> {
    let mut created = Vec::new();
    db.transact(|tx| {
        created = people
            .iter()
            .map(|(name, age)| add_person(tx, name, *age))
            .collect();
    });
    created
}

/// Commits a new age for `person`.
pub fn set_age(db: &Database, person: EntityId, age: i64) -> Change {
    db.transact(|tx| {
        tx.set(person, AGE, age);
    })
}

/// Commits `person`'s employer.
pub fn employ(db: &Database, person: EntityId, company: EntityId) -> Change {
    db.transact(|tx| {
        tx.set(person, EMPLOYER, company);
    })
}

/// Every person entity.
pub fn people() -> Query<EntityId> {
    Query::entities_with(TYPE, PERSON).named("people")
}

/// Every company entity.
pub fn companies() -> Query<EntityId> {
    Query::entities_with(TYPE, COMPANY).named("companies")
}

/// Ages of every person, one match per person.
pub fn ages() -> Query<Value> {
    people().attribute(AGE)
}

/// Ages as integers.
pub fn age_ints() -> Query<i64, Many> {
    people()
        .flat_map(|db, person| db.value(*person, AGE).and_then(|age| age.as_int()))
        .named("people.age_ints")
}

/// `(person, company)` for every employed person.
pub fn employments() -> Query<(EntityId, EntityId)> {
    people()
        .flat_map(|db, person| {
            db.value(*person, EMPLOYER)
                .and_then(|employer| employer.as_entity())
                .map(|company| (*person, company))
        })
        .named("employments")
}

/// Employments joined with the company they point at.
pub fn staff() -> Query<((EntityId, EntityId), EntityId)> {
    employments()
        .join(&companies(), |(_, company)| *company, |company| *company)
        .named("staff")
}
