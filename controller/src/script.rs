//! Recorded touch gestures, replayed in place of a real touch screen
//!
//! One step per line, `#` starts a comment:
//!
//! ```text
//! size 1920 1080
//! down 0 1 400 900
//! down 1 2 1500 900
//! move 1 400 500 2 1500 520
//! wait 250
//! up 1 2
//! up 0 1
//! ```

use anyhow::{anyhow, bail, ensure, Context};
use common::touch::{Pointer, TouchEvent};
use std::str::{FromStr, SplitWhitespace};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Touch(TouchEvent),
    Resize(u32, u32),
    Wait(Duration),
}

pub fn parse(text: &str) -> anyhow::Result<Vec<Step>> {
    let mut steps = Vec::new();

    for (number, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }

        let step = parse_line(line).with_context(|| format!("Line {}: `{line}`", number + 1))?;
        steps.push(step);
    }

    Ok(steps)
}

fn parse_line(line: &str) -> anyhow::Result<Step> {
    let mut words = line.split_whitespace();
    let keyword = words.next().context("Empty step")?;

    let step = match keyword {
        "size" => {
            let width: u32 = next(&mut words, "width")?;
            let height: u32 = next(&mut words, "height")?;
            ensure!(width > 0 && height > 0, "Surface must not be empty");
            Step::Resize(width, height)
        }
        "down" => Step::Touch(TouchEvent::Down(Pointer::new(
            next(&mut words, "index")?,
            next(&mut words, "id")?,
            next(&mut words, "x")?,
            next(&mut words, "y")?,
        ))),
        "move" => {
            let rest: Vec<&str> = words.by_ref().collect();
            ensure!(
                !rest.is_empty() && rest.len() % 3 == 0,
                "Expected `ID X Y` for every pointer"
            );

            let pointers = rest
                .chunks(3)
                .enumerate()
                .map(|(index, pointer)| -> anyhow::Result<Pointer> {
                    Ok(Pointer::new(
                        index,
                        word(pointer[0], "id")?,
                        word(pointer[1], "x")?,
                        word(pointer[2], "y")?,
                    ))
                })
                .collect::<anyhow::Result<_>>()?;
            Step::Touch(TouchEvent::Move(pointers))
        }
        "up" => Step::Touch(TouchEvent::Up {
            index: next(&mut words, "index")?,
            id: next(&mut words, "id")?,
        }),
        "wait" => Step::Wait(Duration::from_millis(next(&mut words, "millis")?)),
        other => bail!("Unknown step `{other}`"),
    };

    if let Some(extra) = words.next() {
        bail!("Unexpected `{extra}`");
    }

    Ok(step)
}

fn next<T>(words: &mut SplitWhitespace, name: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    word(words.next().ok_or_else(|| anyhow!("Missing {name}"))?, name)
}

fn word<T>(word: &str, name: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    word.parse().with_context(|| format!("Bad {name} `{word}`"))
}
