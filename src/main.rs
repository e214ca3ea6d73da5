use std::env;
use std::fs;

use crossgen::{compile, render_clue_listing, render_grid, Generator, GeneratorOptions};

/// Load a dictionary file with one entry per line: the headword followed by
/// `;`-separated synonyms and descriptions.
fn load_dictionaries(path: &str) -> Vec<Vec<Vec<String>>> {
    let raw = fs::read_to_string(path).expect("Something went wrong reading the dictionary file");

    let entries: Vec<Vec<String>> = raw
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let entry: Vec<String> = line
                .split(';')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect();
            if entry.is_empty() {
                None
            } else {
                Some(entry)
            }
        })
        .collect();

    vec![entries]
}

fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let dictionary_path = args
        .next()
        .expect("usage: crossgen <dictionary> [seed] [generations]");
    let seed = args.next();
    let generations: usize = args
        .next()
        .map(|raw| raw.parse().expect("generations must be a number"))
        .unwrap_or(64);

    let dictionaries = load_dictionaries(&dictionary_path);
    let mut on_progress = |percent: u8| {
        if percent % 10 == 0 {
            println!("compiling {}%", percent);
        }
    };
    let compilation = compile(&dictionaries, Some(&mut on_progress));

    let mut generator = Generator::new(GeneratorOptions {
        compilation: Some(compilation),
        ..GeneratorOptions::default()
    })
    .expect("generator options were incomplete");

    let mut population = vec![generator.generate(seed.as_deref())];
    for _ in 0..generations {
        population = generator.iterate(&population);
    }
    population = generator.fill_empty_spaces(&population);

    let best = population.first().expect("selection returned no grids");
    let clues = generator.project_clues(best);

    println!("{:?}", generator.statistics());
    println!("{}", render_grid(best, generator.options().empty_space));
    println!("{}", render_clue_listing(&clues));

    let export = serde_json::to_string_pretty(&clues).expect("clue export failed to serialize");
    fs::write("crossword.json", export).expect("Unable to write file");
    println!("written clue export to crossword.json");
}
