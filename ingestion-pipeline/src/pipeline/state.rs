use state_machines::state_machine;

state_machine! {
    name: IngestionMachine,
    state: IngestionState,
    initial: Ready,
    states: [Ready, Chunked, Embedded, VectorsIndexed, KeywordsIndexed],
    events {
        chunk { transition: { from: Ready, to: Chunked } }
        embed { transition: { from: Chunked, to: Embedded } }
        index_vectors { transition: { from: Embedded, to: VectorsIndexed } }
        index_keywords { transition: { from: VectorsIndexed, to: KeywordsIndexed } }
    }
}

pub fn ready() -> IngestionMachine<(), Ready> {
    IngestionMachine::new(())
}
