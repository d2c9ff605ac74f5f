use std::collections::BTreeSet;

use crate::prompt::types::{CharacterCatalog, CharacterRecord, ExpandError, PromptPair};

pub const TAG_SEPARATOR: &str = ", ";

const RESERVE_LIMIT: usize = 1 << 12;

/// Leading marker added to the positive prompt when several characters share
/// one picture.
pub fn multi_character_prefix(count: usize) -> Option<String> {
    if count > 1 {
        Some(format!("{count}girls"))
    } else {
        None
    }
}

/// Number of pairs `expand` will produce for these characters.
///
/// Saturates instead of overflowing so callers can refuse oversized
/// selections before expanding them.
pub fn combination_count(characters: &[&CharacterRecord]) -> usize {
    collect_slots(characters)
        .iter()
        .fold(1usize, |total, slot| total.saturating_mul(slot.len() + 1))
}

/// Enumerates every combination of optional tags across the characters'
/// categories and renders a positive/negative prompt pair for each.
///
/// Each non-empty category of each character contributes its own slot whose
/// choices are its tags followed by "nothing"; two characters that both have
/// poses pick their poses independently. Slots are walked like an odometer (last slot turns
/// fastest), so index `k` of the result always names the same combination
/// for the same input. Every optional tag that a combination leaves out ends
/// up in that combination's negative prompt, sorted.
pub fn expand(
    characters: &[&CharacterRecord],
    base_prompt: &str,
) -> Result<Vec<PromptPair>, ExpandError> {
    if characters.is_empty() {
        return Err(ExpandError::EmptySelection);
    }

    let slots = collect_slots(characters);
    let universe: BTreeSet<&str> = slots
        .iter()
        .flat_map(|slot| slot.iter().map(String::as_str))
        .collect();

    let prefix = multi_character_prefix(characters.len());
    let mut head: Vec<&str> = Vec::new();
    if let Some(prefix) = prefix.as_deref() {
        head.push(prefix);
    }
    head.push(base_prompt);
    head.extend(
        characters
            .iter()
            .flat_map(|character| character.mandatory_tags.iter().map(String::as_str)),
    );

    let mut cursor = vec![0usize; slots.len()];
    // The count saturates for huge selections; only use it as a bounded hint.
    let mut results = Vec::with_capacity(combination_count(characters).min(RESERVE_LIMIT));
    loop {
        let selected = selected_tags(&slots, &cursor);
        let positive = join_tags(head.iter().copied().chain(selected.iter().copied()));
        let negative = join_tags(
            universe
                .iter()
                .copied()
                .filter(|tag| !selected.contains(tag)),
        );
        results.push(PromptPair { positive, negative });

        if !advance(&mut cursor, &slots) {
            break;
        }
    }

    Ok(results)
}

/// Resolves `ids` against a catalog snapshot and expands the known ones.
/// Unknown IDs are dropped; if none remain the selection is empty.
pub fn expand_selection(
    catalog: &CharacterCatalog,
    ids: &[String],
    base_prompt: &str,
) -> Result<Vec<PromptPair>, ExpandError> {
    let characters = resolve_characters(catalog, ids);
    expand(&characters, base_prompt)
}

pub fn resolve_characters<'a>(
    catalog: &'a CharacterCatalog,
    ids: &[String],
) -> Vec<&'a CharacterRecord> {
    ids.iter().filter_map(|id| catalog.get(id)).collect()
}

fn collect_slots<'a>(characters: &[&'a CharacterRecord]) -> Vec<&'a [String]> {
    characters
        .iter()
        .copied()
        .flat_map(|character| character.categories().map(|(_, tags)| tags))
        .filter(|tags| !tags.is_empty())
        .collect()
}

// A cursor value equal to the slot length is the "nothing" choice.
fn selected_tags<'a>(slots: &[&'a [String]], cursor: &[usize]) -> Vec<&'a str> {
    let mut selected: Vec<&'a str> = Vec::new();
    for (slot, &choice) in slots.iter().copied().zip(cursor) {
        if let Some(tag) = slot.get(choice) {
            if !selected.contains(&tag.as_str()) {
                selected.push(tag.as_str());
            }
        }
    }
    selected
}

fn advance(cursor: &mut [usize], slots: &[&[String]]) -> bool {
    for position in (0..cursor.len()).rev() {
        cursor[position] += 1;
        if cursor[position] <= slots[position].len() {
            return true;
        }
        cursor[position] = 0;
    }
    false
}

fn join_tags<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(TAG_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn robot() -> CharacterRecord {
        CharacterRecord {
            mandatory_tags: tags(&["1boy", "robot"]),
            poses: tags(&["sitting", "standing"]),
            ..CharacterRecord::new("Robot")
        }
    }

    fn knight() -> CharacterRecord {
        let mut knight = CharacterRecord {
            mandatory_tags: tags(&["1girl", "armor"]),
            poses: tags(&["kneeling"]),
            environments: tags(&["castle", "forest", "bridge"]),
            ..CharacterRecord::new("Knight")
        };
        knight
            .optional_categories
            .insert("weapon".to_string(), tags(&["sword", "spear"]));
        knight
    }

    fn split(text: &str) -> Vec<&str> {
        if text.is_empty() {
            Vec::new()
        } else {
            text.split(TAG_SEPARATOR).collect()
        }
    }

    fn universe(characters: &[&CharacterRecord]) -> HashSet<String> {
        characters
            .iter()
            .flat_map(|character| character.categories())
            .flat_map(|(_, tags)| tags.iter().cloned())
            .collect()
    }

    // Selected tags are whatever follows the fixed head of the positive prompt.
    fn selected_from(pair: &PromptPair, head_len: usize) -> HashSet<String> {
        split(&pair.positive)
            .into_iter()
            .skip(head_len)
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn robot_scenario_yields_three_pairs_in_enumeration_order() {
        let robot = robot();
        let pairs = expand(&[&robot], "masterpiece").unwrap();
        assert_eq!(
            pairs,
            vec![
                PromptPair::new("masterpiece, 1boy, robot, sitting", "standing"),
                PromptPair::new("masterpiece, 1boy, robot, standing", "sitting"),
                PromptPair::new("masterpiece, 1boy, robot", "sitting, standing"),
            ]
        );
    }

    #[test]
    fn cardinality_is_product_of_slot_sizes_plus_one() {
        let knight = knight();
        let pairs = expand(&[&knight], "best quality").unwrap();
        assert_eq!(pairs.len(), 2 * 4 * 3);
        assert_eq!(combination_count(&[&knight]), 24);

        let robot = robot();
        let both = expand(&[&robot, &knight], "").unwrap();
        assert_eq!(both.len(), 3 * 24);
    }

    #[test]
    fn without_optional_tags_yields_a_single_pair_with_empty_negative() {
        let plain = CharacterRecord {
            mandatory_tags: tags(&["1girl", "red hair"]),
            ..CharacterRecord::new("Plain")
        };
        let pairs = expand(&[&plain], "masterpiece").unwrap();
        assert_eq!(pairs, vec![PromptPair::new("masterpiece, 1girl, red hair", "")]);
        assert_eq!(combination_count(&[&plain]), 1);
    }

    #[test]
    fn empty_base_prompt_is_skipped() {
        let plain = CharacterRecord {
            mandatory_tags: tags(&["1girl"]),
            ..CharacterRecord::new("Plain")
        };
        let pairs = expand(&[&plain], "").unwrap();
        assert_eq!(pairs[0].positive, "1girl");
    }

    #[test]
    fn negative_is_exact_complement_of_selected_tags() {
        let knight = knight();
        let head_len = 1 + knight.mandatory_tags.len();
        let all = universe(&[&knight]);
        for pair in expand(&[&knight], "masterpiece").unwrap() {
            let selected = selected_from(&pair, head_len);
            let negative: HashSet<String> =
                split(&pair.negative).into_iter().map(str::to_string).collect();
            assert!(selected.is_disjoint(&negative), "{pair:?}");
            let union: HashSet<String> = selected.union(&negative).cloned().collect();
            assert_eq!(union, all, "{pair:?}");
        }
    }

    #[test]
    fn negative_is_exact_complement_across_characters() {
        let robot = robot();
        let guard = CharacterRecord {
            mandatory_tags: tags(&["1girl"]),
            poses: tags(&["standing", "kneeling"]),
            ..CharacterRecord::new("Guard")
        };
        let characters = [&robot, &guard];
        let head_len = 2 + robot.mandatory_tags.len() + guard.mandatory_tags.len();
        let all = universe(&characters);
        let pairs = expand(&characters, "masterpiece").unwrap();
        assert_eq!(pairs.len(), 9);
        assert_eq!(pairs.len(), combination_count(&characters));
        for pair in &pairs {
            let selected = selected_from(pair, head_len);
            let negative: HashSet<String> =
                split(&pair.negative).into_iter().map(str::to_string).collect();
            assert!(selected.is_disjoint(&negative), "{pair:?}");
            let union: HashSet<String> = selected.union(&negative).cloned().collect();
            assert_eq!(union, all, "{pair:?}");
        }
        // Both characters standing collapses to one tag.
        assert_eq!(
            pairs[3].positive,
            "2girls, masterpiece, 1boy, robot, 1girl, standing"
        );
        assert_eq!(pairs[3].negative, "kneeling, sitting");
    }

    #[test]
    fn empty_string_tags_count_as_choices_but_are_not_rendered() {
        let blank = CharacterRecord {
            poses: tags(&["", "sitting"]),
            ..CharacterRecord::new("Blank")
        };
        assert_eq!(
            expand(&[&blank], "m").unwrap(),
            vec![
                PromptPair::new("m", "sitting"),
                PromptPair::new("m, sitting", ""),
                PromptPair::new("m", "sitting"),
            ]
        );
    }

    #[test]
    fn huge_selections_saturate_the_count() {
        let mut wide = CharacterRecord::new("Wide");
        for index in 0..70 {
            wide.optional_categories
                .insert(format!("category{index}"), tags(&["tag"]));
        }
        assert_eq!(combination_count(&[&wide]), usize::MAX);
    }

    #[test]
    fn large_counts_do_not_reserve_everything_up_front() {
        let mut wide = CharacterRecord::new("Wide");
        for index in 0..14 {
            wide.optional_categories
                .insert(format!("category{index}"), tags(&[format!("tag{index}").as_str()]));
        }
        let pairs = expand(&[&wide], "m").unwrap();
        assert_eq!(pairs.len(), 1 << 14);
        assert_eq!(pairs.len(), combination_count(&[&wide]));
    }

    #[test]
    fn negative_tags_are_sorted_lexically() {
        let knight = knight();
        for pair in expand(&[&knight], "").unwrap() {
            let negative = split(&pair.negative);
            let mut sorted = negative.clone();
            sorted.sort();
            assert_eq!(negative, sorted);
        }
    }

    #[test]
    fn expansion_is_deterministic() {
        let robot = robot();
        let knight = knight();
        let first = expand(&[&robot, &knight], "masterpiece").unwrap();
        let second = expand(&[&robot, &knight], "masterpiece").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn no_two_pairs_share_a_selected_set() {
        let knight = knight();
        let head_len = 1 + knight.mandatory_tags.len();
        let pairs = expand(&[&knight], "masterpiece").unwrap();
        let mut seen: Vec<Vec<String>> = Vec::new();
        for pair in &pairs {
            let mut selected: Vec<String> = selected_from(pair, head_len).into_iter().collect();
            selected.sort();
            assert!(!seen.contains(&selected), "duplicate selection in {pair:?}");
            seen.push(selected);
        }
        assert_eq!(seen.len(), pairs.len());
    }

    #[test]
    fn mandatory_tags_follow_base_prompt_in_character_order() {
        let robot = robot();
        let knight = knight();
        for pair in expand(&[&robot, &knight], "masterpiece").unwrap() {
            let parts = split(&pair.positive);
            assert_eq!(
                &parts[..6],
                &["2girls", "masterpiece", "1boy", "robot", "1girl", "armor"]
            );
        }
    }

    #[test]
    fn single_character_has_no_multiplicity_prefix() {
        let robot = robot();
        let pairs = expand(&[&robot], "masterpiece").unwrap();
        assert!(pairs.iter().all(|pair| pair.positive.starts_with("masterpiece")));
        assert_eq!(multi_character_prefix(1), None);
        assert_eq!(multi_character_prefix(3).as_deref(), Some("3girls"));
    }

    #[test]
    fn slots_follow_poses_environments_then_custom_categories() {
        let knight = knight();
        let pairs = expand(&[&knight], "").unwrap();
        assert_eq!(pairs[0].positive, "1girl, armor, kneeling, castle, sword");
        assert_eq!(pairs[1].positive, "1girl, armor, kneeling, castle, spear");
        assert_eq!(pairs[2].positive, "1girl, armor, kneeling, castle");
        assert_eq!(pairs[3].positive, "1girl, armor, kneeling, forest, sword");
        assert_eq!(pairs.last().unwrap().positive, "1girl, armor");
        assert_eq!(
            pairs.last().unwrap().negative,
            "bridge, castle, forest, kneeling, spear, sword"
        );
    }

    #[test]
    fn shared_tags_collapse_in_selection_and_universe() {
        let first = CharacterRecord {
            poses: tags(&["sitting"]),
            ..CharacterRecord::new("First")
        };
        let second = CharacterRecord {
            poses: tags(&["sitting"]),
            ..CharacterRecord::new("Second")
        };
        let pairs = expand(&[&first, &second], "").unwrap();
        assert_eq!(
            pairs,
            vec![
                PromptPair::new("2girls, sitting", ""),
                PromptPair::new("2girls, sitting", ""),
                PromptPair::new("2girls, sitting", ""),
                PromptPair::new("2girls", "sitting"),
            ]
        );
    }

    #[test]
    fn empty_selection_is_rejected() {
        assert_eq!(expand(&[], "x"), Err(ExpandError::EmptySelection));

        let mut catalog = CharacterCatalog::new();
        catalog.insert("Robot".to_string(), robot());
        assert_eq!(
            expand_selection(&catalog, &["Ghost".to_string()], "x"),
            Err(ExpandError::EmptySelection)
        );
        assert_eq!(
            expand_selection(&catalog, &[], "x"),
            Err(ExpandError::EmptySelection)
        );
    }

    #[test]
    fn unknown_ids_are_dropped_from_selection() {
        let mut catalog = CharacterCatalog::new();
        catalog.insert("Robot".to_string(), robot());
        let pairs = expand_selection(
            &catalog,
            &["Ghost".to_string(), "Robot".to_string()],
            "masterpiece",
        )
        .unwrap();
        assert_eq!(pairs.len(), 3);
        assert!(pairs[0].positive.starts_with("masterpiece, 1boy"));
    }
}
